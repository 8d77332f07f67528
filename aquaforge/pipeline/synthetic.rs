//! Deterministic synthetic treatment-plant data for demos and tests.

use chrono::{Datelike, Duration, NaiveDate};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use rand_distr::StandardNormal;

use crate::dataset::{RawDataset, Value};

/// Columns produced by [`wastewater_sample`], in order.
pub const COLUMNS: [&str; 15] = [
    "date",
    "site_id",
    "influent_bod",
    "influent_cod",
    "influent_tss",
    "effluent_bod",
    "effluent_cod",
    "effluent_tss",
    "nh4",
    "no3",
    "po4",
    "flow_m3d",
    "temperature_c",
    "aeration_kwh",
    "energy_kwh",
];

/// Daily readings for `sites` plants over `days` days starting at `start`.
///
/// Rows are ordered by site, then date. Equal arguments give equal datasets.
/// Every cell is present; concentrations are clamped at zero.
#[must_use]
pub fn wastewater_sample(sites: usize, days: usize, start: NaiveDate, seed: u64) -> RawDataset {
    let mut rng = SmallRng::seed_from_u64(seed);
    let mut rows = Vec::with_capacity(sites * days);
    for site in 0..sites {
        let site_id = format!("WWTP_{:02}", site + 1);
        let base_bod = rng.gen_range(5.0..15.0);
        let base_cod = rng.gen_range(20.0..40.0);
        let base_tss = rng.gen_range(10.0..25.0);
        for day in 0..days {
            let Some(date) = i64::try_from(day)
                .ok()
                .and_then(|offset| start.checked_add_signed(Duration::days(offset)))
            else {
                break;
            };
            let seasonal = (std::f64::consts::TAU * f64::from(date.ordinal0()) / 365.0).sin() * 3.0;
            let mut noise = |scale: f64| rng.sample::<f64, _>(StandardNormal) * scale;

            let influent_bod = base_bod * 4.0 + seasonal + noise(2.0);
            let influent_cod = base_cod * 4.0 + seasonal * 1.5 + noise(6.0);
            let influent_tss = base_tss * 3.0 + seasonal + noise(3.0);
            let temperature = 15.0 + seasonal * 5.0 + noise(2.0);
            let energy_noise = noise(100.0);

            let efficiency = rng.gen_range(0.85..0.95);
            let nh4 = rng.gen_range(0.5..3.0) + seasonal * 0.3;
            let no3 = rng.gen_range(2.0..8.0) + seasonal * 0.5;
            let po4 = rng.gen_range(0.3..2.0) + seasonal * 0.2;
            let flow = rng.gen_range(1000.0..5000.0);
            let aeration = rng.gen_range(50.0..200.0);

            let readings = [
                influent_bod,
                influent_cod,
                influent_tss,
                influent_bod * (1.0 - efficiency),
                influent_cod * (1.0 - efficiency * 0.9),
                influent_tss * (1.0 - efficiency * 0.85),
                nh4,
                no3,
                po4,
                flow,
            ];
            let mut row = vec![Value::from(date), Value::from(site_id.as_str())];
            row.extend(readings.iter().map(|value| Value::from(round2(value.max(0.0)))));
            row.push(Value::from(round2(temperature)));
            row.push(Value::from(round2(aeration)));
            row.push(Value::from(round2((flow * 0.5 + aeration + energy_noise).max(0.0))));
            rows.push(row);
        }
    }
    RawDataset::from_trusted(&COLUMNS, rows)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
