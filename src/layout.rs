// Typed views over device buffers.
//
// Every record that crosses the host/device boundary is declared here as a
// `Pod` struct whose in-memory layout matches the std430 layout the WGSL
// kernels declare. A `BufferView<T>` pairs a buffer with an element count
// and a barrier-epoch flyweight shared by all sub-views of the same
// allocation, so sibling views observe each other's write epochs.
//
// wgpu inserts the actual execution/memory barriers itself; the epochs keep
// the producer/consumer contract explicit at call sites and are checked in
// debug builds (a read expectation without a prior write declaration, or a
// host read while a shader write is still pending, is a bug in the caller).

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};

/// Alias table entry: accept probability and redirect index, 8-byte stride.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct AliasEntry {
    pub p: f32,
    pub a: u32,
}

/// Split descriptor: light cursor, heavy cursor and the heavy weight
/// carried into the next split. 12-byte stride.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct SplitEntry {
    pub i: u32,
    pub j: u32,
    pub spill: f32,
}

/// Per-block record of the decoupled-lookback scan, padded to 16 bytes.
/// `state` is one of `STATE_INVALID`, `STATE_AGGREGATE_READY`,
/// `STATE_PREFIX_READY`; the payload fields are published before the flag.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct ScanState {
    pub aggregate: f32,
    pub inclusive_prefix: f32,
    pub state: u32,
    pub _pad: u32,
}

/// Per-block record of the decoupled prefix-partition, padded to 32 bytes.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct PartitionState {
    pub heavy_count: u32,
    pub heavy_count_inclusive_prefix: u32,
    pub heavy_sum: f32,
    pub heavy_inclusive_prefix: f32,
    pub light_sum: f32,
    pub light_inclusive_prefix: f32,
    pub state: u32,
    pub _pad: u32,
}

pub const STATE_INVALID: u32 = 0;
pub const STATE_AGGREGATE_READY: u32 = 1;
pub const STATE_PREFIX_READY: u32 = 2;

/// Bytes reserved in front of a decoupled-state array for the shared batch
/// counter (one u32, padded to 16 so the records stay aligned).
pub const STATE_HEADER_BYTES: u64 = 16;

const EPOCH_HOST_WRITE: u8 = 1 << 0;
const EPOCH_TRANSFER_WRITE: u8 = 1 << 1;
const EPOCH_SHADER_WRITE: u8 = 1 << 2;

/// Write-epoch flyweight. Shared by strong reference between a view and
/// all of its sub-views; views never reference other views.
#[derive(Default)]
pub struct BarrierEpochs(AtomicU8);

impl BarrierEpochs {
    fn set(&self, bit: u8) {
        self.0.fetch_or(bit, Ordering::Relaxed);
    }
    fn clear_all(&self) -> u8 {
        self.0.swap(0, Ordering::Relaxed)
    }
    fn is_set(&self, bit: u8) -> bool {
        self.0.load(Ordering::Relaxed) & bit != 0
    }
}

/// A typed window of `len` elements of `T` in a device buffer.
pub struct BufferView<T: Pod> {
    buffer: Arc<wgpu::Buffer>,
    offset: u64,
    len: u64,
    epochs: Arc<BarrierEpochs>,
    _marker: PhantomData<T>,
}

impl<T: Pod> Clone for BufferView<T> {
    fn clone(&self) -> Self {
        Self {
            buffer: self.buffer.clone(),
            offset: self.offset,
            len: self.len,
            epochs: self.epochs.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Pod> BufferView<T> {
    pub fn stride() -> u64 {
        std::mem::size_of::<T>() as u64
    }

    /// Byte footprint of `len` elements.
    pub fn size_for(len: u64) -> u64 {
        len * Self::stride()
    }

    /// Device-local storage buffer.
    pub fn storage(device: &wgpu::Device, label: &str, len: u64) -> Self {
        Self::with_usage(
            device,
            label,
            len,
            wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
        )
    }

    /// Host-readable staging buffer for downloads.
    pub fn staging(device: &wgpu::Device, label: &str, len: u64) -> Self {
        Self::with_usage(
            device,
            label,
            len,
            wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        )
    }

    pub fn with_usage(
        device: &wgpu::Device,
        label: &str,
        len: u64,
        usage: wgpu::BufferUsages,
    ) -> Self {
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: Self::size_for(len).max(Self::stride()),
            usage,
            mapped_at_creation: false,
        });
        Self {
            buffer: Arc::new(buffer),
            offset: 0,
            len,
            epochs: Arc::new(BarrierEpochs::default()),
            _marker: PhantomData,
        }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn size(&self) -> u64 {
        Self::size_for(self.len)
    }

    pub fn buffer(&self) -> &wgpu::Buffer {
        &self.buffer
    }

    pub fn binding(&self) -> wgpu::BindingResource<'_> {
        wgpu::BindingResource::Buffer(wgpu::BufferBinding {
            buffer: &self.buffer,
            offset: self.offset,
            size: wgpu::BufferSize::new(self.size()),
        })
    }

    /// Sub-view of `len` elements of `U` starting `byte_offset` into this
    /// view. Shares the epoch flyweight with the parent.
    pub fn attribute<U: Pod>(&self, byte_offset: u64, len: u64) -> BufferView<U> {
        debug_assert!(byte_offset + BufferView::<U>::size_for(len) <= self.size());
        BufferView {
            buffer: self.buffer.clone(),
            offset: self.offset + byte_offset,
            len,
            epochs: self.epochs.clone(),
            _marker: PhantomData,
        }
    }

    /// Reinterpret the whole window as another element type.
    pub fn cast<U: Pod>(&self) -> BufferView<U> {
        debug_assert_eq!(self.size() % BufferView::<U>::stride(), 0);
        BufferView {
            buffer: self.buffer.clone(),
            offset: self.offset,
            len: self.size() / BufferView::<U>::stride(),
            epochs: self.epochs.clone(),
            _marker: PhantomData,
        }
    }

    /// Host-side encode into the buffer.
    pub fn upload(&self, queue: &wgpu::Queue, data: &[T]) {
        debug_assert!(data.len() as u64 <= self.len);
        queue.write_buffer(&self.buffer, self.offset, bytemuck::cast_slice(data));
        self.epochs.set(EPOCH_HOST_WRITE);
    }

    /// Record a copy into `dst`, marking it transfer-written.
    pub fn copy_to<U: Pod>(&self, encoder: &mut wgpu::CommandEncoder, dst: &BufferView<U>) {
        debug_assert!(self.size() <= dst.size());
        encoder.copy_buffer_to_buffer(&self.buffer, self.offset, &dst.buffer, dst.offset, self.size());
        dst.epochs.set(EPOCH_TRANSFER_WRITE);
    }

    /// Record a clear-fill of the window.
    pub fn zero(&self, encoder: &mut wgpu::CommandEncoder) {
        encoder.clear_buffer(&self.buffer, self.offset, Some(self.size()));
        self.epochs.set(EPOCH_TRANSFER_WRITE);
    }

    /// Declare that a subsequently recorded dispatch writes this view.
    pub fn expect_compute_write(&self) {
        self.epochs.set(EPOCH_SHADER_WRITE);
    }

    pub fn expect_transfer_write(&self) {
        self.epochs.set(EPOCH_TRANSFER_WRITE);
    }

    pub fn expect_host_write(&self) {
        self.epochs.set(EPOCH_HOST_WRITE);
    }

    /// Consume the pending write epoch before a compute read. wgpu emits
    /// the matching barrier at the pass boundary.
    pub fn expect_compute_read(&self, _encoder: &mut wgpu::CommandEncoder) {
        self.epochs.clear_all();
    }

    /// Consume the pending write epoch before mapping on the host.
    pub fn expect_host_read(&self, _encoder: &mut wgpu::CommandEncoder) {
        let pending = self.epochs.clear_all();
        debug_assert!(
            pending & EPOCH_SHADER_WRITE == 0,
            "host read of a shader-written view; copy to a staging view first"
        );
    }

    /// Map the (staging) window and decode it. The commands producing the
    /// data must already have been submitted; this blocks on the device.
    pub fn download(&self, device: &wgpu::Device) -> Vec<T> {
        debug_assert!(
            !self.epochs.is_set(EPOCH_SHADER_WRITE),
            "download() before expect_host_read()"
        );
        let slice = self.buffer.slice(self.offset..self.offset + self.size());
        let (tx, rx) = futures::channel::oneshot::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        let _ = device.poll(wgpu::PollType::Wait);
        pollster::block_on(rx)
            .expect("map_async callback dropped")
            .expect("buffer mapping failed");
        let out = bytemuck::cast_slice(&slice.get_mapped_range()).to_vec();
        self.buffer.unmap();
        out
    }
}
