//! Nutrient-mix aggregation over the tanks currently feeding the line.

use serde::Serialize;
use std::fmt;

use crate::numeric::parse_or_zero;
use crate::registry::TankConfig;

/// Averaged nutrient percentages. Display formatting is left to callers.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct NutrientMix {
    #[serde(rename = "N")]
    pub n: f64,
    #[serde(rename = "P")]
    pub p: f64,
    #[serde(rename = "K")]
    pub k: f64,
    #[serde(rename = "Ca")]
    pub ca: f64,
    #[serde(rename = "Mg")]
    pub mg: f64,
    #[serde(rename = "S")]
    pub s: f64,
}

impl fmt::Display for NutrientMix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "N {:.1}% P {:.1}% K {:.1}% Ca {:.1}% Mg {:.1}% S {:.1}%",
            self.n, self.p, self.k, self.ca, self.mg, self.s
        )
    }
}

/// Arithmetic mean of each nutrient channel across the tanks selected by
/// `is_active`. Unparsable channels count as 0; no active tanks gives the
/// all-zero mix.
///
/// Tank volume is ignored: every active tank contributes equally.
pub fn aggregate<F>(tanks: &[TankConfig], is_active: F) -> NutrientMix
where
    F: Fn(&TankConfig) -> bool,
{
    let mut total = NutrientMix::default();
    let mut active = 0usize;

    for tank in tanks.iter().filter(|t| is_active(t)) {
        let profile = &tank.nutrient;
        total.n += parse_or_zero(&profile.n);
        total.p += parse_or_zero(&profile.p);
        total.k += parse_or_zero(&profile.k);
        total.ca += parse_or_zero(&profile.ca);
        total.mg += parse_or_zero(&profile.mg);
        total.s += parse_or_zero(&profile.s);
        active += 1;
    }

    if active == 0 {
        return NutrientMix::default();
    }

    let count = active as f64;
    NutrientMix {
        n: total.n / count,
        p: total.p / count,
        k: total.k / count,
        ca: total.ca / count,
        mg: total.mg / count,
        s: total.s / count,
    }
}

// ===========================================================================
// Tests
// ===========================================================================
