//! # Texture Pool - Decoded Pictures Indexed by PTS
//!
//! Pictures handed to the render surface live in a small pool of
//! [`PtsTexture`] entries kept in PTS order. Evicted and consumed entries go
//! to a free list so their plane allocations are reused.
//!
//! A texture is either packed (one RGBA/BGRA plane) or planar (Y, U, V). The
//! kind is resolved from the first picture after open/flush and stays fixed
//! for the rest of the stream.

use thiserror::Error;

use crate::decode::{FrameFormat, Plane, VideoFrame};
use crate::packet::Pts;

#[derive(Debug, Error)]
pub enum TextureError {
    #[error("Picture format {found:?} does not fit a {expected:?} texture")]
    KindMismatch {
        expected: TextureKind,
        found: FrameFormat,
    },
    #[error("Picture has {found} planes, expected {expected}")]
    PlaneCount { expected: usize, found: usize },
}

// ============================================================================
// Vertex
// ============================================================================

/// Full-screen quad vertex
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Vertex {
    pub position: [f32; 2],
    pub tex_coords: [f32; 2],
}

/// Quad covering the viewport, texture clipped at `u_max` on the right
fn quad(u_max: f32) -> [Vertex; 4] {
    [
        Vertex { position: [-1.0, -1.0], tex_coords: [0.0, 1.0] },
        Vertex { position: [1.0, -1.0], tex_coords: [u_max, 1.0] },
        Vertex { position: [1.0, 1.0], tex_coords: [u_max, 0.0] },
        Vertex { position: [-1.0, 1.0], tex_coords: [0.0, 0.0] },
    ]
}

// ============================================================================
// Texture
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureKind {
    /// One interleaved plane
    Packed,
    /// Separate Y, U and V planes
    Planar,
}

impl TextureKind {
    pub fn for_format(format: FrameFormat) -> Self {
        if format.is_planar() {
            Self::Planar
        } else {
            Self::Packed
        }
    }

    pub fn plane_count(&self) -> usize {
        match self {
            Self::Packed => 1,
            Self::Planar => 3,
        }
    }
}

/// A decoded picture waiting to be shown
#[derive(Debug, Clone)]
pub struct PtsTexture {
    pub pts: Pts,
    kind: TextureKind,
    format: FrameFormat,
    width: u32,
    height: u32,
    planes: Vec<Plane>,
}

impl PtsTexture {
    pub fn new(kind: TextureKind) -> Self {
        Self {
            pts: 0,
            kind,
            format: match kind {
                TextureKind::Packed => FrameFormat::Rgba,
                TextureKind::Planar => FrameFormat::I420,
            },
            width: 0,
            height: 0,
            planes: (0..kind.plane_count())
                .map(|_| Plane {
                    data: Vec::new(),
                    stride: 0,
                })
                .collect(),
        }
    }

    pub fn kind(&self) -> TextureKind {
        self.kind
    }

    pub fn plane_count(&self) -> usize {
        self.kind.plane_count()
    }

    pub fn format(&self) -> FrameFormat {
        self.format
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn planes(&self) -> &[Plane] {
        &self.planes
    }

    /// Copy a picture into this texture, keeping existing allocations
    pub fn upload(&mut self, frame: &VideoFrame) -> Result<(), TextureError> {
        if TextureKind::for_format(frame.format) != self.kind {
            return Err(TextureError::KindMismatch {
                expected: self.kind,
                found: frame.format,
            });
        }
        if frame.planes.len() != self.kind.plane_count() {
            return Err(TextureError::PlaneCount {
                expected: self.kind.plane_count(),
                found: frame.planes.len(),
            });
        }

        for (dst, src) in self.planes.iter_mut().zip(&frame.planes) {
            dst.data.clear();
            dst.data.extend_from_slice(&src.data);
            dst.stride = src.stride;
        }
        self.pts = frame.pts;
        self.format = frame.format;
        self.width = frame.width;
        self.height = frame.height;
        Ok(())
    }

    /// Quad for drawing this texture. Planar pictures usually carry row
    /// padding in the luma plane, which is cropped off on the right.
    pub fn vertices(&self) -> [Vertex; 4] {
        match self.kind {
            TextureKind::Packed => quad(1.0),
            TextureKind::Planar => {
                let stride = self.planes.first().map(|p| p.stride).unwrap_or(0);
                if stride == 0 || self.width as usize >= stride {
                    quad(1.0)
                } else {
                    quad(self.width as f32 / stride as f32)
                }
            }
        }
    }

    /// Vertex data as raw bytes for a vertex buffer
    pub fn vertex_bytes(&self) -> Vec<u8> {
        bytemuck::cast_slice(&self.vertices()).to_vec()
    }
}

// ============================================================================
// Pool
// ============================================================================

/// Pool statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub live: usize,
    pub free: usize,
    pub evicted: u64,
    pub recycled: u64,
}

/// At most `capacity` live pictures, sorted by PTS
pub struct TexturePool {
    capacity: usize,
    kind: Option<TextureKind>,
    entries: Vec<PtsTexture>,
    free: Vec<PtsTexture>,
    evicted: u64,
    recycled: u64,
}

impl TexturePool {
    /// The picture on screen stays in the pool until a newer one replaces it,
    /// so the capacity is raised to at least 2 to leave room for that one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            capacity,
            kind: None,
            entries: Vec::with_capacity(capacity),
            free: Vec::new(),
            evicted: 0,
            recycled: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    /// Texture kind in use, `None` until the first picture
    pub fn kind(&self) -> Option<TextureKind> {
        self.kind
    }

    fn acquire(&mut self, kind: TextureKind) -> PtsTexture {
        match self.free.pop() {
            Some(texture) => {
                self.recycled += 1;
                texture
            }
            None => PtsTexture::new(kind),
        }
    }

    fn recycle(&mut self, texture: PtsTexture) {
        if Some(texture.kind) == self.kind {
            self.free.push(texture);
        }
    }

    /// Upload a picture into the pool. When full, the oldest entry is evicted
    /// first and its PTS returned.
    pub fn insert(&mut self, frame: &VideoFrame) -> Result<Option<Pts>, TextureError> {
        let kind = *self
            .kind
            .get_or_insert_with(|| TextureKind::for_format(frame.format));

        let mut texture = self.acquire(kind);
        if let Err(e) = texture.upload(frame) {
            self.recycle(texture);
            return Err(e);
        }

        let mut evicted = None;
        if self.is_full() {
            let oldest = self.entries.remove(0);
            evicted = Some(oldest.pts);
            self.evicted += 1;
            self.recycle(oldest);
        }

        let pos = self.entries.partition_point(|e| e.pts <= texture.pts);
        self.entries.insert(pos, texture);
        Ok(evicted)
    }

    /// Index of the newest entry with `pts <= target`
    pub fn select(&self, target: Pts) -> Option<usize> {
        self.entries
            .partition_point(|e| e.pts <= target)
            .checked_sub(1)
    }

    pub fn get(&self, index: usize) -> Option<&PtsTexture> {
        self.entries.get(index)
    }

    /// Recycle every entry before `index`; returns how many were dropped
    pub fn retire_before(&mut self, index: usize) -> usize {
        let index = index.min(self.entries.len());
        let retired: Vec<PtsTexture> = self.entries.drain(..index).collect();
        for texture in retired {
            self.recycle(texture);
        }
        index
    }

    pub fn oldest_pts(&self) -> Option<Pts> {
        self.entries.first().map(|e| e.pts)
    }

    /// Drop every picture and forget the texture kind
    pub fn clear(&mut self) {
        let entries: Vec<PtsTexture> = self.entries.drain(..).collect();
        for texture in entries {
            self.recycle(texture);
        }
        self.kind = None;
        self.free.clear();
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            live: self.entries.len(),
            free: self.free.len(),
            evicted: self.evicted,
            recycled: self.recycled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rgba(pts: Pts) -> VideoFrame {
        VideoFrame {
            pts,
            width: 2,
            height: 1,
            format: FrameFormat::Rgba,
            planes: vec![Plane {
                data: vec![pts as u8; 8],
                stride: 8,
            }],
        }
    }

    fn i420(pts: Pts, width: u32, stride: usize) -> VideoFrame {
        VideoFrame {
            pts,
            width,
            height: 2,
            format: FrameFormat::I420,
            planes: vec![
                Plane { data: vec![16; stride * 2], stride },
                Plane { data: vec![128; stride / 2], stride: stride / 2 },
                Plane { data: vec![128; stride / 2], stride: stride / 2 },
            ],
        }
    }

    #[test]
    fn test_select_largest_not_after_target() {
        let mut pool = TexturePool::new(8);
        for pts in [0, 33_000, 66_000, 100_000] {
            pool.insert(&rgba(pts)).unwrap();
        }

        let idx = pool.select(70_000).unwrap();
        assert_eq!(pool.get(idx).unwrap().pts, 66_000);
        assert_eq!(pool.select(-1), None);
        assert_eq!(pool.get(pool.select(200_000).unwrap()).unwrap().pts, 100_000);
    }

    #[test]
    fn test_out_of_order_insert_stays_sorted() {
        let mut pool = TexturePool::new(8);
        for pts in [40_000, 0, 80_000, 20_000] {
            pool.insert(&rgba(pts)).unwrap();
        }
        assert_eq!(pool.oldest_pts(), Some(0));
        assert_eq!(pool.get(pool.len() - 1).map(|t| t.pts), Some(80_000));
    }

    #[test]
    fn test_eviction_is_oldest_first() {
        let mut pool = TexturePool::new(3);
        assert_eq!(pool.insert(&rgba(20)).unwrap(), None);
        assert_eq!(pool.insert(&rgba(10)).unwrap(), None);
        assert_eq!(pool.insert(&rgba(30)).unwrap(), None);
        assert!(pool.is_full());

        assert_eq!(pool.insert(&rgba(40)).unwrap(), Some(10));
        assert_eq!(pool.len(), 3);
        assert_eq!(pool.oldest_pts(), Some(20));
        assert_eq!(pool.stats().evicted, 1);
    }

    #[test]
    fn test_pool_keeps_room_beside_displayed_picture() {
        let mut pool = TexturePool::new(1);
        assert_eq!(pool.capacity(), 2);
        pool.insert(&rgba(0)).unwrap();
        assert!(!pool.is_full());
        pool.insert(&rgba(40)).unwrap();
        assert_eq!(pool.get(pool.select(50).unwrap()).unwrap().pts, 40);
    }

    #[test]
    fn test_textures_are_recycled() {
        let mut pool = TexturePool::new(4);
        for pts in 0..4 {
            pool.insert(&rgba(pts)).unwrap();
        }
        assert_eq!(pool.retire_before(2), 2);
        assert_eq!(pool.stats().free, 2);

        pool.insert(&rgba(10)).unwrap();
        let stats = pool.stats();
        assert_eq!(stats.recycled, 1);
        assert_eq!(stats.free, 1);
        assert_eq!(stats.live, 3);
    }

    #[test]
    fn test_kind_fixed_until_clear() {
        let mut pool = TexturePool::new(4);
        pool.insert(&rgba(0)).unwrap();
        assert_eq!(pool.kind(), Some(TextureKind::Packed));

        let err = pool.insert(&i420(1, 4, 4)).unwrap_err();
        assert!(matches!(err, TextureError::KindMismatch { .. }));
        assert_eq!(pool.len(), 1);

        pool.clear();
        assert_eq!(pool.kind(), None);
        pool.insert(&i420(2, 4, 4)).unwrap();
        assert_eq!(pool.kind(), Some(TextureKind::Planar));
        assert_eq!(pool.get(0).unwrap().plane_count(), 3);
    }

    #[test]
    fn test_planar_vertices_crop_stride_padding() {
        let mut texture = PtsTexture::new(TextureKind::Planar);
        texture.upload(&i420(0, 6, 8)).unwrap();
        let v = texture.vertices();
        assert_eq!(v[0].tex_coords, [0.0, 1.0]);
        assert_eq!(v[1].tex_coords, [0.75, 1.0]);
        assert_eq!(v[2].tex_coords, [0.75, 0.0]);

        let mut packed = PtsTexture::new(TextureKind::Packed);
        packed.upload(&rgba(0)).unwrap();
        assert_eq!(packed.vertices()[1].tex_coords, [1.0, 1.0]);
        assert_eq!(packed.vertex_bytes().len(), 4 * std::mem::size_of::<Vertex>());
    }
}
