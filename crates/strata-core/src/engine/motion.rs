use crate::core::geometry::GeomConv;

/// One recorded optimisation step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Motion {
    /// Slice whose optimiser took the step; always 0 in macro mode.
    pub depth: usize,
    pub geom_conv: GeomConv,
    /// Steps taken by the outermost driver so far.
    pub outer_cycle: usize,
    /// `(depth, step)` of the nested driver that produced this record; `(0, 0)` in macro mode.
    pub micro_cycle: (usize, usize),
}

/// Append-only history of optimisation steps.
#[derive(Debug, Clone, Default)]
pub struct MotionLog {
    motions: Vec<Motion>,
}

impl MotionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, motion: Motion) {
        self.motions.push(motion);
    }

    pub fn len(&self) -> usize {
        self.motions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.motions.is_empty()
    }

    /// Most recent record produced at `depth`.
    pub fn last_at_depth(&self, depth: usize) -> Option<&Motion> {
        self.motions.iter().rev().find(|m| m.depth == depth)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Motion> {
        self.motions.iter()
    }

    pub fn as_slice(&self) -> &[Motion] {
        &self.motions
    }
}
