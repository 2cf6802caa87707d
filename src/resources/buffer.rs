use anyhow::{Result, anyhow};
use bytes::BytesMut;
use std::sync::{Arc, Mutex, PoisonError};

/// Scalar type stored in a pooled buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    U8,
    U16,
    F32,
    F64,
}

impl ElementType {
    /// Size of one element in bytes
    pub fn size(&self) -> usize {
        match self {
            ElementType::U8 => 1,
            ElementType::U16 => 2,
            ElementType::F32 => 4,
            ElementType::F64 => 8,
        }
    }
}

/// Shape and element type of a buffer. Two buffers are interchangeable only
/// when their layouts are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BufferLayout {
    shape: Vec<usize>,
    element: ElementType,
    byte_len: usize,
}

impl BufferLayout {
    /// Fails if the total size in bytes does not fit in `usize`.
    pub fn new(shape: &[usize], element: ElementType) -> Result<Self> {
        let byte_len = shape
            .iter()
            .try_fold(element.size(), |len, &dim| len.checked_mul(dim))
            .ok_or_else(|| anyhow!("buffer shape {:?} of {:?} is too large", shape, element))?;

        Ok(Self {
            shape: shape.to_vec(),
            element,
            byte_len,
        })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn element(&self) -> ElementType {
        self.element
    }

    pub fn element_count(&self) -> usize {
        self.byte_len / self.element.size()
    }

    pub fn byte_len(&self) -> usize {
        self.byte_len
    }
}

/// Handle to a zero-initialised buffer owned by the pool.
///
/// Cloning a handle does not copy the storage. The pool keeps one handle per
/// key; any other live clone counts as an outstanding user of the buffer.
#[derive(Clone)]
pub struct Buffer {
    layout: BufferLayout,
    data: Arc<Mutex<BytesMut>>,
}

impl Buffer {
    pub(crate) fn allocate(layout: BufferLayout) -> Self {
        let data = BytesMut::zeroed(layout.byte_len());
        Self {
            layout,
            data: Arc::new(Mutex::new(data)),
        }
    }

    pub fn layout(&self) -> &BufferLayout {
        &self.layout
    }

    pub fn len(&self) -> usize {
        self.layout.byte_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `f` with exclusive access to the bytes.
    pub fn with_data<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut data)
    }

    /// Whether both handles point at the same storage
    pub fn ptr_eq(&self, other: &Buffer) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    /// Live handles to this storage, the pool's own included
    pub(crate) fn handle_count(&self) -> usize {
        Arc::strong_count(&self.data)
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("shape", &self.layout.shape)
            .field("element", &self.layout.element)
            .field("bytes", &self.len())
            .finish()
    }
}
