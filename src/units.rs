// min, mg, L, µg/mL throughout. Infusions are mg/min inside the integrator
// and mg/kg/h everywhere else.

pub const MINUTES_PER_HOUR: f64 = 60.0;

pub fn mg_kg_h_to_mg_min(rate_mg_kg_h: f64, weight_kg: f64) -> f64 {
    rate_mg_kg_h * weight_kg / MINUTES_PER_HOUR
}

pub fn mg_min_to_mg_kg_h(rate_mg_min: f64, weight_kg: f64) -> f64 {
    rate_mg_min * MINUTES_PER_HOUR / weight_kg
}

// µg/mL is mg/L, so no scaling factor here.
pub fn steady_state_infusion_mg_min(target_ug_ml: f64, clearance_l_min: f64) -> f64 {
    target_ug_ml * clearance_l_min
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_rate_conversion_inverts() {
        let mg_min = mg_kg_h_to_mg_min(1.5, 70.0);
        assert_relative_eq!(mg_min, 1.75, epsilon = 1e-12);
        assert_relative_eq!(mg_min_to_mg_kg_h(mg_min, 70.0), 1.5, epsilon = 1e-12);
    }

    #[test]
    fn test_steady_state_infusion() {
        // 1 µg/mL at 1.03 L/min clearance needs 1.03 mg/min, i.e. ~0.883 mg/kg/h at 70 kg
        let mg_min = steady_state_infusion_mg_min(1.0, 1.03);
        assert_relative_eq!(mg_min, 1.03, epsilon = 1e-12);
        assert_relative_eq!(mg_min_to_mg_kg_h(mg_min, 70.0), 0.882857, epsilon = 1e-6);
    }
}
