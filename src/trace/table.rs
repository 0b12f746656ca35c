//! Schema-resolved accessors over one thread's tables.
//!
//! Column positions are looked up by name once, so traces written by
//! different profiler versions (with different column orders) read the same.

use serde_json::Value;

use super::{Category, Table, Thread, TraceError};

const STACK_TABLE: &str = "stackTable";
const FRAME_TABLE: &str = "frameTable";
const SAMPLES: &str = "samples";

/// Read-only view of a thread joined with the trace's category list.
pub struct ThreadView<'a> {
    thread: &'a Thread,
    categories: &'a [Category],
    stack_prefix: usize,
    stack_frame: usize,
    frame_location: usize,
    frame_category: usize,
    frame_window: usize,
    sample_stack: usize,
}

impl<'a> ThreadView<'a> {
    pub fn new(thread: &'a Thread, categories: &'a [Category]) -> Result<Self, TraceError> {
        Ok(Self {
            thread,
            categories,
            stack_prefix: column(&thread.stack_table, STACK_TABLE, "prefix")?,
            stack_frame: column(&thread.stack_table, STACK_TABLE, "frame")?,
            frame_location: column(&thread.frame_table, FRAME_TABLE, "location")?,
            frame_category: column(&thread.frame_table, FRAME_TABLE, "category")?,
            frame_window: column(&thread.frame_table, FRAME_TABLE, "innerWindowID")?,
            sample_stack: column(&thread.samples, SAMPLES, "stack")?,
        })
    }

    pub fn stack_count(&self) -> usize {
        self.thread.stack_table.data.len()
    }

    pub fn sample_count(&self) -> usize {
        self.thread.samples.data.len()
    }

    /// Stack referenced by a sample, `None` when the sample has no stack.
    pub fn sample_stack(&self, sample: usize) -> Result<Option<usize>, TraceError> {
        let row = row(&self.thread.samples, SAMPLES, sample)?;
        index_cell(row, self.sample_stack, SAMPLES, "stack", sample)
    }

    /// True iff the stack's parent pointer is null.
    pub fn is_root(&self, stack: usize) -> Result<bool, TraceError> {
        Ok(self.parent_of(stack)?.is_none())
    }

    pub fn parent_of(&self, stack: usize) -> Result<Option<usize>, TraceError> {
        let row = row(&self.thread.stack_table, STACK_TABLE, stack)?;
        let parent = index_cell(row, self.stack_prefix, STACK_TABLE, "prefix", stack)?;
        if let Some(parent) = parent {
            // dangling prefixes are corruption, not roots
            row_exists(&self.thread.stack_table, STACK_TABLE, parent)?;
        }
        Ok(parent)
    }

    pub fn frame_of(&self, stack: usize) -> Result<usize, TraceError> {
        let row = row(&self.thread.stack_table, STACK_TABLE, stack)?;
        let frame = index_cell(row, self.stack_frame, STACK_TABLE, "frame", stack)?.ok_or(
            TraceError::BadCell {
                table: STACK_TABLE,
                column: "frame",
                row: stack,
            },
        )?;
        row_exists(&self.thread.frame_table, FRAME_TABLE, frame)?;
        Ok(frame)
    }

    /// Human-readable frame label, dereferenced through the string table.
    pub fn label_of(&self, frame: usize) -> Result<&'a str, TraceError> {
        let row = row(&self.thread.frame_table, FRAME_TABLE, frame)?;
        let index = index_cell(row, self.frame_location, FRAME_TABLE, "location", frame)?.ok_or(
            TraceError::BadCell {
                table: FRAME_TABLE,
                column: "location",
                row: frame,
            },
        )?;
        self.thread
            .string_table
            .get(index)
            .map(String::as_str)
            .ok_or(TraceError::StringOutOfRange {
                index,
                len: self.thread.string_table.len(),
            })
    }

    /// Category name of a frame; frames without a category yield `None`.
    pub fn category_name_of(&self, frame: usize) -> Result<Option<&'a str>, TraceError> {
        let row = row(&self.thread.frame_table, FRAME_TABLE, frame)?;
        let Some(index) = index_cell(row, self.frame_category, FRAME_TABLE, "category", frame)?
        else {
            return Ok(None);
        };
        self.categories
            .get(index)
            .map(|c| Some(c.name.as_str()))
            .ok_or(TraceError::CategoryOutOfRange {
                index,
                len: self.categories.len(),
            })
    }

    /// Window id owning the frame. `0` and null both mean "no window".
    pub fn window_of(&self, frame: usize) -> Result<Option<u64>, TraceError> {
        let row = row(&self.thread.frame_table, FRAME_TABLE, frame)?;
        let window = index_cell(row, self.frame_window, FRAME_TABLE, "innerWindowID", frame)?;
        Ok(window.map(|w| w as u64).filter(|w| *w != 0))
    }
}

fn column(table: &Table, name: &'static str, column: &'static str) -> Result<usize, TraceError> {
    table
        .schema
        .get(column)
        .copied()
        .ok_or(TraceError::MissingColumn {
            table: name,
            column,
        })
}

fn row<'t>(table: &'t Table, name: &'static str, index: usize) -> Result<&'t [Value], TraceError> {
    table
        .data
        .get(index)
        .map(Vec::as_slice)
        .ok_or(TraceError::RowOutOfRange {
            table: name,
            index,
            len: table.data.len(),
        })
}

fn row_exists(table: &Table, name: &'static str, index: usize) -> Result<(), TraceError> {
    row(table, name, index).map(|_| ())
}

/// Read an integer reference cell. Null (or a short row) is `None`; anything
/// that is not a non-negative integer is corruption.
fn index_cell(
    row: &[Value],
    position: usize,
    table: &'static str,
    column: &'static str,
    row_index: usize,
) -> Result<Option<usize>, TraceError> {
    match row.get(position) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_u64()
            .map(|v| Some(v as usize))
            .ok_or(TraceError::BadCell {
                table,
                column,
                row: row_index,
            }),
    }
}
