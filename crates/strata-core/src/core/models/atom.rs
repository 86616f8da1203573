use super::ids::AtomIndex;
use nalgebra::{Point3, Vector3};
use serde::{Deserialize, Serialize};

/// Electrostatic multipoles of an atomic site.
///
/// Only the monopole (partial charge) and the dipole are tracked, which is what the
/// embedding of deeper layers consumes.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Multipoles {
    /// Partial charge in elementary charge units.
    pub monopole: f64,
    /// Atomic dipole in e·Å.
    pub dipole: Vector3<f64>,
}

impl Multipoles {
    /// Creates multipoles consisting of a bare point charge.
    pub fn charge(monopole: f64) -> Self {
        Self {
            monopole,
            dipole: Vector3::zeros(),
        }
    }

    /// Returns the multipoles with every component multiplied by `factor`.
    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            monopole: self.monopole * factor,
            dipole: self.dipole * factor,
        }
    }
}

/// Describes how a link atom caps a bond cut by a layer boundary.
///
/// The link atom replaces the atom `capped` (which lives in the parent layer only) and is
/// bonded to `bonded_to` (which lives in both layers). Its position follows
/// `r_link = r_bonded_to + g_factor * (r_capped - r_bonded_to)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinkInfo {
    /// Index of the real atom in the parent layer that this link atom replaces.
    pub capped: AtomIndex,
    /// Index of the atom inside the layer that the link atom is bonded to.
    pub bonded_to: AtomIndex,
    /// Scaling factor placing the link atom along the cut bond.
    pub g_factor: f64,
}

/// An atom of one layer.
///
/// Atoms are plain values stored in per-layer tables. Relations to other atoms are expressed
/// through indices only, never through references, so a layer can be cloned or replaced
/// wholesale without fixing up pointers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Atom {
    /// Element symbol (e.g., "C", "H", "Fe").
    pub element: String,
    /// Cartesian position in Ångström.
    pub position: Point3<f64>,
    /// Current electrostatic multipoles of this site.
    pub multipoles: Multipoles,
    /// Marks synthetic atoms that never take part in optimisations.
    pub is_dummy: bool,
    /// Present if this atom is a link atom capping a cut bond.
    pub link: Option<LinkInfo>,
}

impl Atom {
    /// Creates a real (non-dummy, non-link) atom without multipoles.
    pub fn new(element: &str, position: Point3<f64>) -> Self {
        Self {
            element: element.to_string(),
            position,
            multipoles: Multipoles::default(),
            is_dummy: false,
            link: None,
        }
    }

    /// Creates a link atom with the given capping relation.
    pub fn link(element: &str, position: Point3<f64>, link: LinkInfo) -> Self {
        Self {
            link: Some(link),
            ..Self::new(element, position)
        }
    }

    /// Returns `true` if this atom caps a cut bond.
    pub fn is_link(&self) -> bool {
        self.link.is_some()
    }

    /// Returns `true` for atoms that are neither dummies nor link atoms.
    pub fn is_real(&self) -> bool {
        !self.is_dummy && self.link.is_none()
    }
}

/// Computes the position of a link atom from the positions of its partners.
pub fn link_position(bonded_to: &Point3<f64>, capped: &Point3<f64>, g_factor: f64) -> Point3<f64> {
    bonded_to + (capped - bonded_to) * g_factor
}
