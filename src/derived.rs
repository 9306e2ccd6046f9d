use crate::prelude::*;

use std::collections::HashMap;

const SQRT_3: f64 = 1.732;

/// Fills unmapped roles from the ones that were resolved, the way a real
/// three-phase meter's values relate. `values` holds one effective value per
/// role; only roles for which `is_mapped` is false are overwritten.
pub fn fill_unmapped<F>(values: &mut HashMap<Role, f64>, is_mapped: F)
where
    F: Fn(Role) -> bool,
{
    use Role::*;

    fn get(values: &HashMap<Role, f64>, role: Role) -> f64 {
        values.get(&role).copied().unwrap_or(0.0)
    }
    let set = |values: &mut HashMap<Role, f64>, role: Role, value: f64| {
        if !is_mapped(role) {
            values.insert(role, value);
        }
    };

    let reference_voltage = get(values, VoltageL1);
    if reference_voltage > 0.0 {
        for role in [VoltageL1L2, VoltageL2L3, VoltageL3L1] {
            set(&mut *values, role, reference_voltage * SQRT_3);
        }
        for role in [VoltageL2, VoltageL3] {
            set(&mut *values, role, reference_voltage);
        }
    }

    let total_power = get(values, PowerTotal);
    if total_power > 0.0 {
        for role in [PowerL1, PowerL2, PowerL3] {
            set(&mut *values, role, total_power / 3.0);
        }
    }

    for (power, voltage, current) in [
        (PowerL1, VoltageL1, CurrentL1),
        (PowerL2, VoltageL2, CurrentL2),
        (PowerL3, VoltageL3, CurrentL3),
    ] {
        let p = get(values, power);
        let v = get(values, voltage);
        if p > 0.0 && v > 0.0 {
            // kW -> W
            set(&mut *values, current, p * 1000.0 / v);
        }
    }

    let active = get(values, PowerTotal);
    let reactive = get(values, ReactivePowerTotal);
    if active > 0.0 {
        let power_factor = if reactive > 0.0 {
            active / (active * active + reactive * reactive).sqrt()
        } else {
            1.0
        };
        set(&mut *values, PowerFactorTotal, power_factor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> HashMap<Role, f64> {
        crate::register_map::DTSU666_REGISTERS
            .iter()
            .map(|d| (d.role, d.default))
            .collect()
    }

    #[test]
    fn derives_from_required_roles() {
        let mut values = defaults();
        values.insert(Role::PowerTotal, 3.0);
        values.insert(Role::VoltageL1, 240.0);
        values.insert(Role::Frequency, 50.0);

        let mapped = [Role::PowerTotal, Role::VoltageL1, Role::Frequency];
        fill_unmapped(&mut values, |role| mapped.contains(&role));

        assert_eq!(values[&Role::VoltageL2], 240.0);
        assert!((values[&Role::VoltageL1L2] - 415.68).abs() < 1e-9);
        assert_eq!(values[&Role::PowerL1], 1.0);
        assert!((values[&Role::CurrentL1] - 1000.0 / 240.0).abs() < 1e-9);
        assert_eq!(values[&Role::PowerFactorTotal], 1.0);
        assert_eq!(values[&Role::CurrentNeutral], 0.0);
    }

    #[test]
    fn never_overrides_mapped_roles() {
        let mut values = defaults();
        values.insert(Role::PowerTotal, 3.0);
        values.insert(Role::PowerL1, 2.5);
        values.insert(Role::ReactivePowerTotal, 4.0);

        let mapped = [Role::PowerTotal, Role::PowerL1, Role::ReactivePowerTotal];
        fill_unmapped(&mut values, |role| mapped.contains(&role));

        assert_eq!(values[&Role::PowerL1], 2.5);
        assert_eq!(values[&Role::PowerL2], 1.0);
        assert!((values[&Role::PowerFactorTotal] - 0.6).abs() < 1e-9);
    }

    #[test]
    fn export_leaves_phase_values_alone() {
        let mut values = defaults();
        values.insert(Role::PowerTotal, -2.0);

        fill_unmapped(&mut values, |role| role == Role::PowerTotal);

        assert_eq!(values[&Role::PowerL1], 0.0);
        assert_eq!(values[&Role::PowerFactorTotal], 0.95);
    }
}
