use serde::{Deserialize, Serialize};
use std::fmt;

/// Index of an atom. The same index denotes the same physical atom in every layer.
pub type AtomIndex = usize;

/// Identifies a layer by the path of child indices leading to it from the root.
///
/// The empty path is the root layer (the complete system). `[0, 1]` is the second child of
/// the first child of the root. The depth of a layer is the length of its path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct LayerId(Vec<usize>);

impl LayerId {
    /// Returns the identifier of the root layer.
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Returns the child-index path of this layer.
    pub fn path(&self) -> &[usize] {
        &self.0
    }

    /// Returns the depth of this layer in the tree (0 for the root).
    pub fn depth(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if this identifies the root layer.
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the identifier of the `index`-th child of this layer.
    pub fn child(&self, index: usize) -> Self {
        let mut path = self.0.clone();
        path.push(index);
        Self(path)
    }

    /// Returns the identifier of the parent layer, or `None` for the root.
    pub fn parent(&self) -> Option<Self> {
        if self.0.is_empty() {
            None
        } else {
            Some(Self(self.0[..self.0.len() - 1].to_vec()))
        }
    }

    /// Returns the identifiers of all strict ancestors, ordered from the root downwards.
    pub fn ancestors(&self) -> Vec<Self> {
        (0..self.0.len())
            .map(|len| Self(self.0[..len].to_vec()))
            .collect()
    }
}

impl From<Vec<usize>> for LayerId {
    fn from(path: Vec<usize>) -> Self {
        Self(path)
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "/");
        }
        for idx in &self.0 {
            write!(f, "/{}", idx)?;
        }
        Ok(())
    }
}

/// Distinguishes the calculations attached to a layer.
///
/// `Original` is the layer's own level of theory. `Inherited` is the level of theory of the
/// parent layer evaluated on this layer's atoms, which is subtracted in the ONIOM expression.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum CalcKey {
    Original,
    Inherited,
}

impl fmt::Display for CalcKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Original => write!(f, "original"),
            Self::Inherited => write!(f, "inherited"),
        }
    }
}

/// A single dispatchable calculation: one calculation key on one layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CalcId {
    pub layer: LayerId,
    pub key: CalcKey,
}

impl CalcId {
    pub fn new(layer: LayerId, key: CalcKey) -> Self {
        Self { layer, key }
    }

    pub fn original(layer: LayerId) -> Self {
        Self::new(layer, CalcKey::Original)
    }

    pub fn inherited(layer: LayerId) -> Self {
        Self::new(layer, CalcKey::Inherited)
    }
}

impl fmt::Display for CalcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.layer, self.key)
    }
}
