//! Capture bundle specification: the ordered set of capture stages one fusion
//! cycle waits for.

use indexmap::IndexSet;

use super::frame::CaptureId;

/// Ordered, duplicate-free set of capture ids describing one fusion cycle.
///
/// Order is the order fused buffers are handed to the fusion collaborator.
/// Repeated ids collapse onto their first position.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CaptureBundleSpec {
    stages: IndexSet<CaptureId>,
}

impl CaptureBundleSpec {
    pub fn new(ids: impl IntoIterator<Item = CaptureId>) -> Self {
        Self {
            stages: ids.into_iter().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn contains(&self, id: CaptureId) -> bool {
        self.stages.contains(&id)
    }

    /// Position of `id` within the bundle
    pub fn position(&self, id: CaptureId) -> Option<usize> {
        self.stages.get_index_of(&id)
    }

    pub fn ids(&self) -> impl DoubleEndedIterator<Item = CaptureId> + '_ {
        self.stages.iter().copied()
    }

    pub fn to_vec(&self) -> Vec<CaptureId> {
        self.ids().collect()
    }
}

impl FromIterator<CaptureId> for CaptureBundleSpec {
    fn from_iter<I: IntoIterator<Item = CaptureId>>(iter: I) -> Self {
        Self::new(iter)
    }
}
