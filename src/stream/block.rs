//! Reference-counted data blocks backing [`MemoryStream`](super::MemoryStream).
//!
//! A block is immutable once published: streams share blocks by cloning the
//! `Arc`, never by copying, and a block's bytes are frozen at publish time.
//! Externally donated memory may carry a disposer that runs when the last
//! reference drops.

use std::fmt;
use std::sync::Arc;

/// Monotonic block identity inside one stream. Never reused, even after the
/// block itself is retired.
pub type BlockId = u64;

/// Callback invoked when the last reference to an external block drops.
pub type Disposer = Box<dyn FnOnce() + Send + Sync>;

/// An immutable, shareable run of bytes.
pub struct DataBlock {
    data: Box<[u8]>,
    disposer: Option<Disposer>,
}

impl DataBlock {
    /// Publishes owned bytes as a block.
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { data: data.into_boxed_slice(), disposer: None }
    }

    /// Publishes externally produced bytes. `disposer` runs exactly once,
    /// when the final reference to this block is dropped.
    pub fn external(data: Box<[u8]>, disposer: Option<Disposer>) -> Self {
        Self { data, disposer }
    }

    /// Shorthand used by the append paths.
    pub fn shared(data: Vec<u8>) -> Arc<Self> {
        Arc::new(Self::from_vec(data))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for DataBlock {
    fn drop(&mut self) {
        if let Some(disposer) = self.disposer.take() {
            disposer();
        }
    }
}

impl fmt::Debug for DataBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataBlock")
            .field("len", &self.data.len())
            .field("external", &self.disposer.is_some())
            .finish()
    }
}
