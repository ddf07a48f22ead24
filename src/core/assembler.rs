use super::kernel::ChunkResult;
use crate::types::{ElevationGrid, ElevationView, GridRegion, MetricGrid, TopoError, TopoResult, NODATA};
use ndarray::{s, Array2};
use serde::{Deserialize, Serialize};

/// What happens to the cells within the border width of the grid edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BorderPolicy {
    /// Border cells are always no-data
    #[default]
    Mask,
    /// Keep whatever the kernel produced at the border
    Keep,
}

/// Collects chunk results into a pre-allocated, NaN-initialised output grid
pub struct ResultAssembler {
    output: MetricGrid,
    written: Array2<bool>,
    writable: GridRegion,
    border: usize,
    cells_written: usize,
}

impl ResultAssembler {
    pub fn new(shape: (usize, usize), border: usize, policy: BorderPolicy) -> Self {
        let writable = match policy {
            BorderPolicy::Mask => GridRegion::inset(shape, border),
            BorderPolicy::Keep => GridRegion::full(shape),
        };

        log::debug!(
            "Result grid {}x{}, border {} ({:?}), writable {:?}",
            shape.0,
            shape.1,
            border,
            policy,
            writable
        );

        Self {
            output: Array2::from_elem(shape, NODATA),
            written: Array2::from_elem(shape, false),
            writable,
            border,
            cells_written: 0,
        }
    }

    pub fn shape(&self) -> (usize, usize) {
        self.output.dim()
    }

    pub fn border(&self) -> usize {
        self.border
    }

    /// Copy a chunk interior into the output at its global offset
    pub fn write(&mut self, result: &ChunkResult) -> TopoResult<()> {
        let chunk = &result.chunk;
        if result.values.dim() != chunk.shape() {
            return Err(TopoError::ShapeMismatch {
                expected: chunk.shape(),
                actual: result.values.dim(),
            });
        }

        let interior_local = chunk.interior_local();
        let source = result.values.slice(s![
            interior_local.row_start..interior_local.row_end,
            interior_local.col_start..interior_local.col_end
        ]);
        self.write_region(chunk.interior, source)
    }

    /// Copy a full-grid result (the wavelet path) into the output
    pub fn write_grid(&mut self, values: &ElevationGrid) -> TopoResult<()> {
        if values.dim() != self.shape() {
            return Err(TopoError::ShapeMismatch {
                expected: self.shape(),
                actual: values.dim(),
            });
        }
        self.write_region(GridRegion::full(self.shape()), values.view())
    }

    /// Write `source`, which covers `region` of the output
    fn write_region(&mut self, region: GridRegion, source: ElevationView<'_>) -> TopoResult<()> {
        let target = region.intersect(&GridRegion::full(self.shape()));
        if target != region || source.dim() != region.shape() {
            return Err(TopoError::ShapeMismatch {
                expected: region.shape(),
                actual: source.dim(),
            });
        }

        let allowed = region.intersect(&self.writable);
        for i in region.row_start..region.row_end {
            for j in region.col_start..region.col_end {
                if self.written[[i, j]] {
                    return Err(TopoError::Processing(format!(
                        "output cell ({}, {}) written twice",
                        i, j
                    )));
                }
                self.written[[i, j]] = true;
                self.cells_written += 1;

                if allowed.contains(i, j) {
                    self.output[[i, j]] = source[[i - region.row_start, j - region.col_start]];
                }
            }
        }
        Ok(())
    }

    /// Whether every cell has been claimed by exactly one write
    pub fn is_complete(&self) -> bool {
        self.cells_written == self.output.len()
    }

    pub fn finish(self) -> MetricGrid {
        if !self.is_complete() {
            log::warn!(
                "Result grid incomplete: {} of {} cells written",
                self.cells_written,
                self.output.len()
            );
        }
        self.output
    }
}
