use std::fmt;

use serde::{Deserialize, Serialize};

/// Share counts. Signed so intermediate differences never wrap.
pub type Shares = i64;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vehicle {
    Rsu,
    Nso,
    Iso,
}

impl Vehicle {
    pub const ALL: [Vehicle; 3] = [Vehicle::Iso, Vehicle::Nso, Vehicle::Rsu];

    pub fn as_str(self) -> &'static str {
        match self {
            Vehicle::Rsu => "rsu",
            Vehicle::Nso => "nso",
            Vehicle::Iso => "iso",
        }
    }

    pub fn is_option(self) -> bool {
        !matches!(self, Vehicle::Rsu)
    }
}

impl fmt::Display for Vehicle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One value per vehicle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PerVehicle<T> {
    pub rsu: T,
    pub nso: T,
    pub iso: T,
}

impl<T> PerVehicle<T> {
    pub fn get(&self, vehicle: Vehicle) -> &T {
        match vehicle {
            Vehicle::Rsu => &self.rsu,
            Vehicle::Nso => &self.nso,
            Vehicle::Iso => &self.iso,
        }
    }

    pub fn get_mut(&mut self, vehicle: Vehicle) -> &mut T {
        match vehicle {
            Vehicle::Rsu => &mut self.rsu,
            Vehicle::Nso => &mut self.nso,
            Vehicle::Iso => &mut self.iso,
        }
    }
}

/// A request to sell `quantity` shares of one grant at `price_usd`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaleOrder {
    pub grant: String,
    pub quantity: Shares,
    pub price_usd: f64,
    /// Exercise vested options before selling already-held stock.
    #[serde(default)]
    pub prefer_exercise: bool,
}

impl SaleOrder {
    pub fn new(grant: impl Into<String>, quantity: Shares, price_usd: f64) -> Self {
        Self {
            grant: grant.into(),
            quantity,
            price_usd,
            prefer_exercise: false,
        }
    }

    pub fn preferring_exercise(mut self) -> Self {
        self.prefer_exercise = true;
        self
    }
}
