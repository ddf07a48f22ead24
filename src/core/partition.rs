use crate::types::{GridRegion, TopoError, TopoResult};

/// Overlapping tile of the grid
///
/// `extent` is the region read by the kernel (interior plus the overlap
/// border, clipped to the grid); `interior` is the region this chunk owns in
/// the output. Interiors of all chunks tile the grid exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    /// Position in partition order (row-major over the chunk lattice)
    pub index: usize,
    pub extent: GridRegion,
    pub interior: GridRegion,
    pub overlap: usize,
}

impl Chunk {
    /// Global coordinate of the interior's top-left cell
    pub fn origin(&self) -> (usize, usize) {
        (self.interior.row_start, self.interior.col_start)
    }

    /// Interior expressed in extent-local coordinates
    pub fn interior_local(&self) -> GridRegion {
        self.interior.relative_to(&self.extent)
    }

    pub fn shape(&self) -> (usize, usize) {
        self.extent.shape()
    }

    /// Convert an extent-local coordinate to global coordinates
    pub fn to_global(&self, local_row: usize, local_col: usize) -> (usize, usize) {
        (
            self.extent.row_start + local_row,
            self.extent.col_start + local_col,
        )
    }
}

/// Splits a grid into overlapping chunks
///
/// The partitioner is a plain value: every call to [`ChunkPartitioner::iter`]
/// recomputes the same sequence from `(grid_shape, window_radius, chunk_size)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPartitioner {
    grid_shape: (usize, usize),
    window_radius: usize,
    chunk_size: usize,
    stride: usize,
}

impl ChunkPartitioner {
    /// Create a partitioner whose chunk interiors span `chunk_size` cells per
    /// axis, read with an overlap border of `window_radius` on every side
    pub fn new(
        grid_shape: (usize, usize),
        window_radius: usize,
        chunk_size: usize,
    ) -> TopoResult<Self> {
        if chunk_size <= 2 * window_radius {
            return Err(TopoError::InvalidConfig(format!(
                "chunk_size {} must exceed twice the window radius ({})",
                chunk_size,
                2 * window_radius
            )));
        }

        Ok(Self {
            grid_shape,
            window_radius,
            chunk_size,
            stride: chunk_size,
        })
    }

    /// A partitioner producing one chunk covering the whole grid
    pub fn single(grid_shape: (usize, usize), window_radius: usize) -> Self {
        let stride = grid_shape.0.max(grid_shape.1).max(2 * window_radius + 1);
        Self {
            grid_shape,
            window_radius,
            chunk_size: stride,
            stride,
        }
    }

    pub fn grid_shape(&self) -> (usize, usize) {
        self.grid_shape
    }

    pub fn window_radius(&self) -> usize {
        self.window_radius
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Interior side length of a full (unclipped) chunk, equal to `chunk_size`
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Number of chunks along (rows, cols)
    pub fn lattice(&self) -> (usize, usize) {
        let (rows, cols) = self.grid_shape;
        (
            (rows + self.stride - 1) / self.stride,
            (cols + self.stride - 1) / self.stride,
        )
    }

    pub fn len(&self) -> usize {
        let (chunk_rows, chunk_cols) = self.lattice();
        chunk_rows * chunk_cols
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Chunk at a given partition index
    pub fn chunk(&self, index: usize) -> Option<Chunk> {
        if index >= self.len() {
            return None;
        }

        let (rows, cols) = self.grid_shape;
        let (_, chunk_cols) = self.lattice();
        let block_row = index / chunk_cols;
        let block_col = index % chunk_cols;

        let row_start = block_row * self.stride;
        let col_start = block_col * self.stride;
        let interior = GridRegion::new(
            row_start,
            (row_start + self.stride).min(rows),
            col_start,
            (col_start + self.stride).min(cols),
        );

        let extent = GridRegion::new(
            interior.row_start.saturating_sub(self.window_radius),
            (interior.row_end + self.window_radius).min(rows),
            interior.col_start.saturating_sub(self.window_radius),
            (interior.col_end + self.window_radius).min(cols),
        );

        Some(Chunk {
            index,
            extent,
            interior,
            overlap: self.window_radius,
        })
    }

    pub fn iter(&self) -> ChunkIter {
        ChunkIter {
            partitioner: *self,
            next_index: 0,
        }
    }
}

impl IntoIterator for &ChunkPartitioner {
    type Item = Chunk;
    type IntoIter = ChunkIter;

    fn into_iter(self) -> ChunkIter {
        self.iter()
    }
}

/// Lazy iterator over the chunks of a [`ChunkPartitioner`]
#[derive(Debug, Clone)]
pub struct ChunkIter {
    partitioner: ChunkPartitioner,
    next_index: usize,
}

impl Iterator for ChunkIter {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        let chunk = self.partitioner.chunk(self.next_index)?;
        self.next_index += 1;
        Some(chunk)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.partitioner.len().saturating_sub(self.next_index);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for ChunkIter {}

/// Partition `grid_shape` into overlapping chunks
pub fn partition(
    grid_shape: (usize, usize),
    window_radius: usize,
    chunk_size: usize,
) -> TopoResult<ChunkIter> {
    Ok(ChunkPartitioner::new(grid_shape, window_radius, chunk_size)?.iter())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn coverage(shape: (usize, usize), radius: usize, chunk_size: usize) -> Array2<u32> {
        let mut counts = Array2::<u32>::zeros(shape);
        for chunk in partition(shape, radius, chunk_size).unwrap() {
            for r in chunk.interior.row_start..chunk.interior.row_end {
                for c in chunk.interior.col_start..chunk.interior.col_end {
                    counts[[r, c]] += 1;
                }
            }
        }
        counts
    }

    #[test]
    fn test_interiors_tile_exactly_once() {
        let cases = [
            ((100, 100), 1, 32),
            ((37, 91), 2, 5),
            ((5, 5), 1, 3),
            ((64, 64), 3, 64),
            ((1, 200), 0, 7),
            ((13, 17), 4, 100),
        ];

        for (shape, radius, chunk_size) in cases {
            let counts = coverage(shape, radius, chunk_size);
            assert!(
                counts.iter().all(|&n| n == 1),
                "shape {:?} radius {} chunk {} not tiled exactly once",
                shape,
                radius,
                chunk_size
            );
        }
    }

    #[test]
    fn test_rejects_small_chunk() {
        assert!(matches!(
            partition((10, 10), 2, 4),
            Err(TopoError::InvalidConfig(_))
        ));
        assert!(partition((10, 10), 2, 5).is_ok());
        assert!(ChunkPartitioner::new((10, 10), 0, 0).is_err());
    }

    #[test]
    fn test_overlap_clipped_to_grid() {
        let partitioner = ChunkPartitioner::new((20, 20), 2, 8).unwrap();
        assert_eq!(partitioner.stride(), 8);
        assert_eq!(partitioner.lattice(), (3, 3));

        let first = partitioner.chunk(0).unwrap();
        assert_eq!(first.interior, GridRegion::new(0, 8, 0, 8));
        assert_eq!(first.extent, GridRegion::new(0, 10, 0, 10));
        assert_eq!(first.interior_local(), GridRegion::new(0, 8, 0, 8));

        let second = partitioner.chunk(1).unwrap();
        assert_eq!(second.origin(), (0, 8));
        assert_eq!(second.extent, GridRegion::new(0, 10, 6, 18));
        assert_eq!(second.interior_local(), GridRegion::new(0, 8, 2, 10));

        let last = partitioner.chunk(8).unwrap();
        assert_eq!(last.interior, GridRegion::new(16, 20, 16, 20));
        assert_eq!(last.extent, GridRegion::new(14, 20, 14, 20));
        assert!(partitioner.chunk(9).is_none());
    }

    #[test]
    fn test_chunk_size_is_interior_stride() {
        let partitioner = ChunkPartitioner::new((100, 100), 2, 10).unwrap();
        assert_eq!(partitioner.stride(), 10);
        assert_eq!(partitioner.len(), 100);

        let inner = partitioner.chunk(11).unwrap();
        assert_eq!(inner.interior, GridRegion::new(10, 20, 10, 20));
        assert_eq!(inner.extent, GridRegion::new(8, 22, 8, 22));
        assert_eq!(inner.shape(), (14, 14));
    }

    #[test]
    fn test_restartable() {
        let partitioner = ChunkPartitioner::new((50, 30), 1, 9).unwrap();
        let first: Vec<_> = partitioner.iter().collect();
        let second: Vec<_> = partitioner.iter().collect();
        assert_eq!(first, second);
        assert_eq!(first.len(), partitioner.len());
        assert_eq!(partitioner.iter().len(), partitioner.len());
    }

    #[test]
    fn test_single_chunk_covers_grid() {
        let partitioner = ChunkPartitioner::single((40, 25), 3);
        assert_eq!(partitioner.len(), 1);
        let chunk = partitioner.chunk(0).unwrap();
        assert_eq!(chunk.interior, GridRegion::full((40, 25)));
        assert_eq!(chunk.extent, GridRegion::full((40, 25)));
    }
}
