//! # SQLite vehicle store
//!
//! [`SqliteVehicleStore`] persists listings and their embeddings in a single `vehicles`
//! table through Diesel. The connection is synchronous, so every call hops onto the
//! blocking pool; one connection is shared behind a mutex, which serialises writes.
//!
//! Nearest-neighbour queries are an exact cosine scan over the embedded rows (see
//! [`crate::vector_store::rank_candidates`]). That is linear in inventory size, which is
//! fine for a marketplace's live listings.
//!
//! The table is created on open if missing.

use async_trait::async_trait;
use diesel::{connection::SimpleConnection, prelude::*};
use std::sync::{Arc, Mutex};

use crate::{
    error::{MatchError, Result},
    models::{VehicleAttributes, VehicleRow, encode_vector},
    schema::vehicles,
    vector_store::{Neighbor, VehicleStore, rank_candidates},
    vehicle::{StoredEmbedding, VehicleRecord},
};

const CREATE_VEHICLES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS vehicles (
    id TEXT PRIMARY KEY NOT NULL,
    brand TEXT NOT NULL,
    model TEXT NOT NULL,
    version TEXT,
    vehicle_type TEXT NOT NULL,
    body_type TEXT,
    manufacture_year INTEGER,
    model_year INTEGER,
    price DOUBLE,
    mileage BIGINT,
    fuel TEXT,
    transmission TEXT,
    color TEXT,
    doors INTEGER,
    power TEXT,
    traction TEXT,
    city TEXT,
    state TEXT,
    description TEXT,
    equipment TEXT NOT NULL DEFAULT '[]',
    embedding BLOB,
    embedding_model TEXT,
    embedding_digest TEXT,
    embedded_at TEXT
);
"#;

pub fn establish_connection(db_url: &str) -> Result<SqliteConnection> {
    Ok(SqliteConnection::establish(db_url)?)
}

#[derive(Clone)]
pub struct SqliteVehicleStore {
    conn: Arc<Mutex<SqliteConnection>>,
}

impl SqliteVehicleStore {
    /// Open (creating if needed) the database at `db_url`.
    pub fn open(db_url: &str) -> Result<Self> {
        let mut conn = establish_connection(db_url)?;
        conn.batch_execute(CREATE_VEHICLES_TABLE)?;
        tracing::debug!("Vehicle store ready at {}", db_url);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut SqliteConnection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| MatchError::Storage("vehicle store connection poisoned".into()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| MatchError::Storage(format!("vehicle store task failed: {e}")))?
    }

    /// Insert a listing or replace its attributes. The embedding columns are left
    /// untouched.
    pub async fn upsert_vehicle(&self, vehicle: &VehicleRecord) -> Result<()> {
        let attributes = VehicleAttributes::try_from(vehicle)?;
        self.with_conn(move |conn| {
            diesel::insert_into(vehicles::table)
                .values(&attributes)
                .on_conflict(vehicles::id)
                .do_update()
                .set(&attributes)
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    /// Remove a listing and, with it, its embedding.
    pub async fn remove_vehicle(&self, vehicle_id: &str) -> Result<bool> {
        let vehicle_id = vehicle_id.to_string();
        self.with_conn(move |conn| {
            let deleted = diesel::delete(vehicles::table.find(vehicle_id.as_str())).execute(conn)?;
            Ok(deleted > 0)
        })
        .await
    }

    /// Ids of every listing, in id order.
    pub async fn vehicle_ids(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            Ok(vehicles::table
                .select(vehicles::id)
                .order(vehicles::id.asc())
                .load::<String>(conn)?)
        })
        .await
    }
}

#[async_trait]
impl VehicleStore for SqliteVehicleStore {
    async fn fetch_attributes(&self, vehicle_id: &str) -> Result<VehicleRecord> {
        let id = vehicle_id.to_string();
        let row = self
            .with_conn(move |conn| {
                Ok(vehicles::table
                    .find(id.as_str())
                    .select(VehicleRow::as_select())
                    .first::<VehicleRow>(conn)
                    .optional()?)
            })
            .await?;

        match row {
            Some(row) => VehicleRecord::try_from(row),
            None => Err(MatchError::NotFound(format!("vehicle {vehicle_id}"))),
        }
    }

    async fn upsert_embedding(&self, vehicle_id: &str, embedding: StoredEmbedding) -> Result<()> {
        let id = vehicle_id.to_string();
        let blob = encode_vector(&embedding.vector)?;
        let embedded_at = chrono::Utc::now().to_rfc3339();

        let updated = self
            .with_conn(move |conn| {
                Ok(diesel::update(vehicles::table.find(id.as_str()))
                    .set((
                        vehicles::embedding.eq(Some(blob)),
                        vehicles::embedding_model.eq(Some(embedding.model)),
                        vehicles::embedding_digest.eq(Some(embedding.digest)),
                        vehicles::embedded_at.eq(Some(embedded_at)),
                    ))
                    .execute(conn)?)
            })
            .await?;

        if updated == 0 {
            return Err(MatchError::NotFound(format!("vehicle {vehicle_id}")));
        }
        Ok(())
    }

    async fn nearest_neighbors(
        &self,
        query: &[f32],
        model: &str,
        k: usize,
    ) -> Result<Vec<Neighbor>> {
        let rows = self
            .with_conn(|conn| {
                vehicles::table
                    .filter(vehicles::embedding.is_not_null())
                    .select(VehicleRow::as_select())
                    .load::<VehicleRow>(conn)
                    .map_err(|e| MatchError::SearchBackend(e.to_string()))
            })
            .await
            .map_err(|e| match e {
                MatchError::Storage(msg) => MatchError::SearchBackend(msg),
                other => other,
            })?;

        let candidates = rows
            .into_iter()
            .map(VehicleRecord::try_from)
            .collect::<Result<Vec<_>>>()
            .map_err(|e| MatchError::SearchBackend(e.to_string()))?;

        rank_candidates(query, model, k, candidates)
    }

    async fn delete_embedding(&self, vehicle_id: &str) -> Result<()> {
        let id = vehicle_id.to_string();
        self.with_conn(move |conn| {
            diesel::update(vehicles::table.find(id.as_str()))
                .set((
                    vehicles::embedding.eq(None::<Vec<u8>>),
                    vehicles::embedding_model.eq(None::<String>),
                    vehicles::embedding_digest.eq(None::<String>),
                    vehicles::embedded_at.eq(None::<String>),
                ))
                .execute(conn)?;
            Ok(())
        })
        .await
    }
}
