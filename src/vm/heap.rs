use super::tagged::{INDEX_LIMIT, Tagged};
use crate::runtime::Failure;

/// Cells before the first field: shape tag, GC mark.
pub const HEADER_SIZE: usize = 2;
const SHAPE_OFFSET: usize = 0;
const GC_OFFSET: usize = 1;

/// Flat cell array with a bump pointer. Nothing is ever reclaimed; a
/// reference stays valid for the lifetime of the heap.
///
/// Object layout: `[shape (dict tag), gc mark, field0, field1, ...]`.
pub struct Heap {
    cells: Vec<Tagged>,
    hp: usize,
    id: u32,
}

impl Heap {
    pub fn new(id: u32, capacity: usize) -> Self {
        Heap { cells: vec![Tagged::UNDEFINED; capacity], hp: 0, id }
    }

    /// Identity used to recognize records materialized from this heap.
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.cells.len()
    }

    /// Cells in use.
    pub fn used(&self) -> usize {
        self.hp
    }

    pub fn fits(&self, field_count: usize) -> bool {
        self.hp + HEADER_SIZE + field_count <= self.cells.len()
    }

    /// Bump-allocate an object. Returns `None` when it does not fit; the
    /// caller decides whether to grow or give up.
    pub fn alloc(&mut self, shape: Tagged, fields: &[Tagged]) -> Option<Tagged> {
        if !self.fits(fields.len()) {
            return None;
        }
        let reference = Tagged::reference(self.hp as u32)?;
        let start = self.hp;
        self.cells[start + SHAPE_OFFSET] = shape;
        self.cells[start + GC_OFFSET] = Tagged::UNMARKED;
        self.cells[start + HEADER_SIZE..start + HEADER_SIZE + fields.len()].copy_from_slice(fields);
        self.hp += HEADER_SIZE + fields.len();
        Some(reference)
    }

    /// Double the capacity, capped at the reference limit. Returns false
    /// when the heap cannot grow any further.
    pub fn grow(&mut self) -> bool {
        let limit = INDEX_LIMIT as usize;
        if self.cells.len() >= limit {
            return false;
        }
        let new_len = (self.cells.len().max(1) * 2).min(limit);
        self.cells.resize(new_len, Tagged::UNDEFINED);
        true
    }

    fn object(&self, reference: u32) -> Result<usize, Failure> {
        let start = reference as usize;
        if start + HEADER_SIZE > self.hp {
            return Err(Failure::internal(format!("dangling heap reference @{reference}")));
        }
        Ok(start)
    }

    /// Shape tag stored in the object header.
    pub fn shape_of(&self, reference: u32) -> Result<Tagged, Failure> {
        let start = self.object(reference)?;
        Ok(self.cells[start + SHAPE_OFFSET])
    }

    pub fn field(&self, reference: u32, offset: u32) -> Result<Tagged, Failure> {
        let cell = self.field_cell(reference, offset)?;
        Ok(self.cells[cell])
    }

    pub fn set_field(&mut self, reference: u32, offset: u32, value: Tagged) -> Result<(), Failure> {
        let cell = self.field_cell(reference, offset)?;
        self.cells[cell] = value;
        Ok(())
    }

    fn field_cell(&self, reference: u32, offset: u32) -> Result<usize, Failure> {
        let cell = self.object(reference)? + HEADER_SIZE + offset as usize;
        if cell >= self.hp {
            return Err(Failure::internal(format!("field {offset} outside object @{reference}")));
        }
        Ok(cell)
    }

    /// Allocated cells, for dumps.
    pub fn cells(&self) -> &[Tagged] {
        &self.cells[..self.hp]
    }
}
