//! # Database models
//!
//! Data structures that map to the `vehicles` table (see [`crate::schema`]) via
//! **Diesel**.
//!
//! - [`VehicleRow`]: a full row as read back, embedding columns included.
//! - [`VehicleAttributes`]: the listing-owned columns only. Writing it never touches
//!   the embedding, so an attribute edit leaves the previous vector in place until the
//!   next sync.
//!
//! ### Column encodings
//! - `equipment` is a JSON array of strings.
//! - `embedding` is the `bincode` (standard config) encoding of a `Vec<f32>`.
//! - `embedded_at` is an RFC 3339 timestamp.
use diesel::prelude::*;
use tracing::warn;

use crate::{
    error::{MatchError, Result},
    vehicle::{StoredEmbedding, VehicleRecord, VehicleType},
};

#[derive(Queryable, Selectable, Debug, Clone, PartialEq)]
#[diesel(table_name = crate::schema::vehicles)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct VehicleRow {
    pub id: String,
    pub brand: String,
    pub model: String,
    pub version: Option<String>,
    pub vehicle_type: String,
    pub body_type: Option<String>,
    pub manufacture_year: Option<i32>,
    pub model_year: Option<i32>,
    pub price: Option<f64>,
    pub mileage: Option<i64>,
    pub fuel: Option<String>,
    pub transmission: Option<String>,
    pub color: Option<String>,
    pub doors: Option<i32>,
    pub power: Option<String>,
    pub traction: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub description: Option<String>,
    pub equipment: String,
    pub embedding: Option<Vec<u8>>,
    pub embedding_model: Option<String>,
    pub embedding_digest: Option<String>,
    pub embedded_at: Option<String>,
}

/// Listing-owned columns, used for insert-or-update of attributes.
#[derive(Insertable, AsChangeset, Debug, Clone, PartialEq)]
#[diesel(table_name = crate::schema::vehicles)]
#[diesel(treat_none_as_null = true)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct VehicleAttributes {
    pub id: String,
    pub brand: String,
    pub model: String,
    pub version: Option<String>,
    pub vehicle_type: String,
    pub body_type: Option<String>,
    pub manufacture_year: Option<i32>,
    pub model_year: Option<i32>,
    pub price: Option<f64>,
    pub mileage: Option<i64>,
    pub fuel: Option<String>,
    pub transmission: Option<String>,
    pub color: Option<String>,
    pub doors: Option<i32>,
    pub power: Option<String>,
    pub traction: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub description: Option<String>,
    pub equipment: String,
}

pub fn encode_vector(vector: &[f32]) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(vector, bincode::config::standard())
        .map_err(|e| MatchError::Storage(format!("failed to encode embedding: {e}")))
}

pub fn decode_vector(bytes: &[u8]) -> Result<Vec<f32>> {
    let (vector, _read): (Vec<f32>, usize) =
        bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| MatchError::Storage(format!("failed to decode embedding: {e}")))?;
    Ok(vector)
}

impl TryFrom<&VehicleRecord> for VehicleAttributes {
    type Error = MatchError;

    fn try_from(vehicle: &VehicleRecord) -> Result<Self> {
        Ok(Self {
            id: vehicle.id.clone(),
            brand: vehicle.brand.clone(),
            model: vehicle.model.clone(),
            version: vehicle.version.clone(),
            vehicle_type: vehicle.vehicle_type.as_str().to_string(),
            body_type: vehicle.body_type.clone(),
            manufacture_year: vehicle.manufacture_year,
            model_year: vehicle.model_year,
            price: vehicle.price,
            mileage: vehicle.mileage,
            fuel: vehicle.fuel.clone(),
            transmission: vehicle.transmission.clone(),
            color: vehicle.color.clone(),
            doors: vehicle.doors,
            power: vehicle.power.clone(),
            traction: vehicle.traction.clone(),
            city: vehicle.city.clone(),
            state: vehicle.state.clone(),
            description: vehicle.description.clone(),
            equipment: serde_json::to_string(&vehicle.equipment)?,
        })
    }
}

impl TryFrom<VehicleRow> for VehicleRecord {
    type Error = MatchError;

    fn try_from(row: VehicleRow) -> Result<Self> {
        let vehicle_type = VehicleType::parse(&row.vehicle_type).unwrap_or_else(|| {
            warn!(id = %row.id, vehicle_type = %row.vehicle_type, "Unknown vehicle type, treating as car");
            VehicleType::Car
        });

        let equipment: Vec<String> = if row.equipment.trim().is_empty() {
            Vec::new()
        } else {
            serde_json::from_str(&row.equipment)?
        };

        let embedding = match (row.embedding, row.embedding_model, row.embedding_digest) {
            (Some(bytes), Some(model), digest) => Some(StoredEmbedding {
                vector: decode_vector(&bytes)?,
                model,
                digest: digest.unwrap_or_default(),
            }),
            _ => None,
        };

        Ok(VehicleRecord {
            id: row.id,
            brand: row.brand,
            model: row.model,
            version: row.version,
            vehicle_type,
            body_type: row.body_type,
            manufacture_year: row.manufacture_year,
            model_year: row.model_year,
            price: row.price,
            mileage: row.mileage,
            fuel: row.fuel,
            transmission: row.transmission,
            color: row.color,
            doors: row.doors,
            power: row.power,
            traction: row.traction,
            city: row.city,
            state: row.state,
            description: row.description,
            equipment,
            embedding,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vector_blob_round_trip() {
        let vector = vec![0.25f32, -1.5, 3.0];
        let bytes = encode_vector(&vector).unwrap();
        assert_eq!(decode_vector(&bytes).unwrap(), vector);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_vector(&[0xff, 0xff, 0xff]).is_err());
    }
}
