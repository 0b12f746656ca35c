//! Test-only builders for synthetic traces.

use serde_json::{json, Value};

use super::{Category, Thread, TraceDocument};

pub const OTHER: usize = 0;
pub const JS: usize = 1;
pub const DOM: usize = 2;

pub fn categories() -> Vec<Category> {
    ["Other", "JavaScript", "DOM"]
        .into_iter()
        .map(|name| Category {
            name: name.to_string(),
        })
        .collect()
}

/// Builds one thread with the common column layout.
#[derive(Default)]
pub struct ThreadBuilder {
    strings: Vec<String>,
    frames: Vec<Value>,
    stacks: Vec<Value>,
    samples: Vec<Value>,
}

impl ThreadBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn root(&mut self) -> usize {
        self.raw_stack(json!([null, null]))
    }

    pub fn frame(&mut self, label: &str, category: usize, window: Option<u64>) -> usize {
        let string = self.intern(label);
        self.raw_frame(json!([string, category, window]))
    }

    pub fn stack(&mut self, parent: usize, frame: usize) -> usize {
        self.raw_stack(json!([parent, frame]))
    }

    /// Push a frame and a stack on top of `parent` in one go.
    pub fn push(
        &mut self,
        parent: usize,
        label: &str,
        category: usize,
        window: Option<u64>,
    ) -> usize {
        let frame = self.frame(label, category, window);
        self.stack(parent, frame)
    }

    pub fn sample(&mut self, stack: usize) {
        self.samples.push(json!([stack, self.samples.len() as f64]));
    }

    pub fn raw_stack(&mut self, row: Value) -> usize {
        self.stacks.push(row);
        self.stacks.len() - 1
    }

    pub fn raw_frame(&mut self, row: Value) -> usize {
        self.frames.push(row);
        self.frames.len() - 1
    }

    pub fn raw_sample(&mut self, row: Value) {
        self.samples.push(row);
    }

    fn intern(&mut self, s: &str) -> usize {
        if let Some(i) = self.strings.iter().position(|x| x == s) {
            return i;
        }
        self.strings.push(s.to_string());
        self.strings.len() - 1
    }

    pub fn to_json(&self) -> Value {
        json!({
            "name": "GeckoMain",
            "stackTable": { "schema": { "prefix": 0, "frame": 1 }, "data": self.stacks },
            "frameTable": {
                "schema": { "location": 0, "category": 1, "innerWindowID": 2 },
                "data": self.frames
            },
            "samples": { "schema": { "stack": 0, "time": 1 }, "data": self.samples },
            "stringTable": self.strings
        })
    }

    pub fn build(&self) -> Thread {
        serde_json::from_value(self.to_json()).expect("fixture thread")
    }
}

/// A single-process trace document.
///
/// `pages` are `(window, url, embedder)` triples.
pub fn document_json(pages: &[(u64, &str, Option<u64>)], threads: &[&ThreadBuilder]) -> Value {
    let pages: Vec<Value> = pages
        .iter()
        .map(|(id, url, embedder)| {
            json!({
                "tabID": 1,
                "innerWindowID": id,
                "url": url,
                "embedderInnerWindowID": embedder.unwrap_or(0),
            })
        })
        .collect();
    json!({
        "meta": {
            "version": 27,
            "categories": [
                { "name": "Other", "color": "grey" },
                { "name": "JavaScript", "color": "yellow" },
                { "name": "DOM", "color": "blue" }
            ]
        },
        "processes": [{
            "pages": pages,
            "threads": threads.iter().map(|t| t.to_json()).collect::<Vec<_>>()
        }]
    })
}

pub fn document(pages: &[(u64, &str, Option<u64>)], threads: &[&ThreadBuilder]) -> TraceDocument {
    serde_json::from_value(document_json(pages, threads)).expect("fixture document")
}

/// The canonical qualifying sample: a page script calling one DOM API.
pub fn single_call(api: &str) -> ThreadBuilder {
    let mut b = ThreadBuilder::new();
    let root = b.root();
    let main = b.push(root, "main (https://site.test/app.js:10:4)", JS, Some(1));
    let call = b.push(main, api, DOM, Some(1));
    b.sample(call);
    b
}
