//! # Vehicle records
//!
//! [`VehicleRecord`] is the listing data the matcher reads. The listing subsystem owns
//! it; the matcher only ever writes the [`StoredEmbedding`] attached to it.
//!
//! [`describe`] renders a record into the paragraph that gets embedded. The rendering is
//! deterministic: the same attribute values always give the same text, byte for byte,
//! and the field order is fixed:
//!
//! 1. identity (brand, model, version, years)
//! 2. vehicle type and body
//! 3. mechanical specs (fuel, transmission, power, traction, mileage, doors, color)
//! 4. price
//! 5. location
//! 6. category tag for the vehicle type
//! 7. equipment list
//! 8. the seller's free-text description
//!
//! The embedding itself is never part of the description.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::format::{format_location, format_mileage, format_price};

/// Listing category. Equipment lists and the category tag depend on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VehicleType {
    #[default]
    Car,
    Moto,
    Bus,
    Truck,
    Van,
    Tractor,
    Implement,
}

impl VehicleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            VehicleType::Car => "car",
            VehicleType::Moto => "moto",
            VehicleType::Bus => "bus",
            VehicleType::Truck => "truck",
            VehicleType::Van => "van",
            VehicleType::Tractor => "tractor",
            VehicleType::Implement => "implement",
        }
    }

    /// Portuguese noun used in descriptions.
    pub fn label(&self) -> &'static str {
        match self {
            VehicleType::Car => "carro",
            VehicleType::Moto => "moto",
            VehicleType::Bus => "ônibus",
            VehicleType::Truck => "caminhão",
            VehicleType::Van => "van",
            VehicleType::Tractor => "trator",
            VehicleType::Implement => "implemento agrícola",
        }
    }

    /// Usage tag that pulls category-level queries ("algo para a fazenda") toward the
    /// right listings.
    pub fn category_tag(&self) -> &'static str {
        match self {
            VehicleType::Car => "veículo de passeio para uso urbano e familiar",
            VehicleType::Moto => "motocicleta para mobilidade ágil e econômica",
            VehicleType::Bus => "transporte coletivo de passageiros",
            VehicleType::Truck => "veículo de carga para transporte e logística",
            VehicleType::Van => "utilitário para passageiros ou carga leve",
            VehicleType::Tractor => "máquina agrícola para trabalho no campo",
            VehicleType::Implement => "equipamento agrícola acoplável",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "car" | "carro" => Some(VehicleType::Car),
            "moto" | "motorcycle" => Some(VehicleType::Moto),
            "bus" | "onibus" | "ônibus" => Some(VehicleType::Bus),
            "truck" | "caminhao" | "caminhão" => Some(VehicleType::Truck),
            "van" => Some(VehicleType::Van),
            "tractor" | "trator" => Some(VehicleType::Tractor),
            "implement" | "implemento" => Some(VehicleType::Implement),
            _ => None,
        }
    }
}

impl fmt::Display for VehicleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An embedding as persisted on a vehicle, with enough provenance to tell whether it is
/// still current.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEmbedding {
    pub vector: Vec<f32>,
    /// Model identifier that produced `vector`.
    pub model: String,
    /// blake3 hex digest of the description text that was embedded.
    pub digest: String,
}

impl StoredEmbedding {
    pub fn dimension(&self) -> usize {
        self.vector.len()
    }
}

/// Authoritative listing data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct VehicleRecord {
    pub id: String,
    pub brand: String,
    pub model: String,
    pub version: Option<String>,
    pub vehicle_type: VehicleType,
    pub body_type: Option<String>,
    pub manufacture_year: Option<i32>,
    pub model_year: Option<i32>,
    /// Asking price in BRL.
    pub price: Option<f64>,
    /// Odometer reading in km.
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
    /// Optional equipment for the vehicle's category, in the order the seller listed it.
    pub equipment: Vec<String>,
    #[serde(skip)]
    pub embedding: Option<StoredEmbedding>,
}

impl VehicleRecord {
    /// "Toyota Corolla XEi 2022/2023"
    pub fn title(&self) -> String {
        let mut title = join_present([
            Some(self.brand.as_str()),
            Some(self.model.as_str()),
            self.version.as_deref(),
        ]);
        if let Some(years) = self.years() {
            if !title.is_empty() {
                title.push(' ');
            }
            title.push_str(&years);
        }
        title
    }

    fn years(&self) -> Option<String> {
        match (self.manufacture_year, self.model_year) {
            (Some(made), Some(model)) if made != model => Some(format!("{made}/{model}")),
            (Some(year), _) | (None, Some(year)) => Some(year.to_string()),
            (None, None) => None,
        }
    }

    pub fn location(&self) -> Option<String> {
        format_location(self.city.as_deref(), self.state.as_deref())
    }
}

fn join_present<'a>(parts: impl IntoIterator<Item = Option<&'a str>>) -> String {
    parts
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}

/// Render a vehicle into the paragraph fed to the embedding model.
pub fn describe(vehicle: &VehicleRecord) -> String {
    let mut sentences: Vec<String> = Vec::new();

    let title = vehicle.title();
    if !title.is_empty() {
        sentences.push(format!("Veículo: {title}."));
    }

    let kind = match non_blank(vehicle.body_type.as_deref()) {
        Some(body) => format!("Tipo: {}, carroceria {}.", vehicle.vehicle_type.label(), body),
        None => format!("Tipo: {}.", vehicle.vehicle_type.label()),
    };
    sentences.push(kind);

    let mut specs: Vec<String> = Vec::new();
    if let Some(fuel) = non_blank(vehicle.fuel.as_deref()) {
        specs.push(format!("combustível {fuel}"));
    }
    if let Some(transmission) = non_blank(vehicle.transmission.as_deref()) {
        specs.push(format!("câmbio {transmission}"));
    }
    if let Some(power) = non_blank(vehicle.power.as_deref()) {
        specs.push(format!("potência {power}"));
    }
    if let Some(traction) = non_blank(vehicle.traction.as_deref()) {
        specs.push(format!("tração {traction}"));
    }
    if let Some(mileage) = vehicle.mileage {
        specs.push(format!("{} rodados", format_mileage(mileage)));
    }
    if let Some(doors) = vehicle.doors {
        specs.push(format!("{doors} portas"));
    }
    if let Some(color) = non_blank(vehicle.color.as_deref()) {
        specs.push(format!("cor {color}"));
    }
    if !specs.is_empty() {
        sentences.push(format!("Especificações: {}.", specs.join(", ")));
    }

    if let Some(price) = vehicle.price {
        sentences.push(format!("Preço: {}.", format_price(price)));
    }

    if let Some(location) = vehicle.location() {
        sentences.push(format!("Localização: {location}."));
    }

    sentences.push(format!(
        "Categoria: {}.",
        vehicle.vehicle_type.category_tag()
    ));

    let equipment: Vec<&str> = vehicle
        .equipment
        .iter()
        .map(|e| e.trim())
        .filter(|e| !e.is_empty())
        .collect();
    if !equipment.is_empty() {
        sentences.push(format!("Opcionais: {}.", equipment.join(", ")));
    }

    if let Some(description) = non_blank(vehicle.description.as_deref()) {
        sentences.push(format!("Descrição: {description}"));
    }

    sentences.join(" ")
}

/// blake3 digest of a description, used to detect attribute changes.
pub fn description_digest(description: &str) -> String {
    blake3::hash(description.as_bytes()).to_hex().to_string()
}
