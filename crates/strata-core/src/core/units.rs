//! Length conversions between the Ångström used throughout the model and the atomic units
//! expected by external optimisers.

pub const ANGSTROM_TO_BOHR: f64 = 1.889_726_124_625_770_2;
pub const BOHR_TO_ANGSTROM: f64 = 1.0 / ANGSTROM_TO_BOHR;

#[inline]
pub fn angstrom_to_bohr(value: f64) -> f64 {
    value * ANGSTROM_TO_BOHR
}

#[inline]
pub fn bohr_to_angstrom(value: f64) -> f64 {
    value * BOHR_TO_ANGSTROM
}

/// Converts a gradient in Hartree/Å into forces in Hartree/Bohr.
#[inline]
pub fn gradient_to_atomic_forces(gradient: f64) -> f64 {
    -gradient * BOHR_TO_ANGSTROM
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversions_are_inverse() {
        let x = 1.234;
        assert!((bohr_to_angstrom(angstrom_to_bohr(x)) - x).abs() < 1e-12);
        assert!((angstrom_to_bohr(1.0) - 1.8897261246).abs() < 1e-9);
    }

    #[test]
    fn forces_have_opposite_sign_and_atomic_units() {
        let force = gradient_to_atomic_forces(ANGSTROM_TO_BOHR);
        assert!((force + 1.0).abs() < 1e-12);
    }
}
