//! DOM API attribution
//!
//! Walks every sample of every selected thread, keeps samples that are DOM
//! API calls made from page script, and attributes each one to the script
//! that made it and to the first/third party pages it ran under.

pub mod label;

use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

use crate::trace::{Page, SubprocessRecord, Thread, ThreadView, TraceDocument, TraceError};

use label::{is_automation_frame, is_dom_call, is_internal_url, is_valid_url, script_url_from_label};

const JAVASCRIPT: &str = "JavaScript";

/// Who a call is attributed to. Any part may be unknown.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourceKey {
    pub first_party: Option<String>,
    pub third_party: Option<String>,
    pub script_url: Option<String>,
    pub valid_script_url: Option<String>,
}

/// Per-source API call counts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApiCounter {
    counts: BTreeMap<SourceKey, BTreeMap<String, u64>>,
}

impl ApiCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, key: SourceKey, api: &str) {
        self.add(key, api, 1);
    }

    pub fn add(&mut self, key: SourceKey, api: &str, count: u64) {
        let apis = self.counts.entry(key).or_default();
        match apis.get_mut(api) {
            Some(n) => *n += count,
            None => {
                apis.insert(api.to_string(), count);
            }
        }
    }

    /// Fold another counter into this one.
    pub fn merge(&mut self, other: ApiCounter) {
        for (key, apis) in other.counts {
            let mine = self.counts.entry(key).or_default();
            for (api, count) in apis {
                *mine.entry(api).or_insert(0) += count;
            }
        }
    }

    pub fn get(&self, key: &SourceKey, api: &str) -> u64 {
        self.counts
            .get(key)
            .and_then(|apis| apis.get(api))
            .copied()
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Number of distinct (source, api) pairs.
    pub fn len(&self) -> usize {
        self.counts.values().map(BTreeMap::len).sum()
    }

    pub fn total_calls(&self) -> u64 {
        self.counts.values().flat_map(BTreeMap::values).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SourceKey, &str, u64)> {
        self.counts.iter().flat_map(|(key, apis)| {
            apis.iter()
                .map(move |(api, count)| (key, api.as_str(), *count))
        })
    }

    /// Debug dump: one entry per source, keyed by its JSON-encoded tuple.
    pub fn to_json(&self) -> Value {
        let mut out = Map::new();
        for (key, apis) in &self.counts {
            let tuple = serde_json::json!([
                key.first_party,
                key.third_party,
                key.script_url,
                key.valid_script_url
            ]);
            let apis: Map<String, Value> = apis
                .iter()
                .map(|(api, n)| (api.clone(), Value::from(*n)))
                .collect();
            out.insert(tuple.to_string(), Value::Object(apis));
        }
        Value::Object(out)
    }
}

/// What one document contributed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnalysisStats {
    pub threads: usize,
    pub samples: usize,
    pub recorded: usize,
}

/// The default process predicate: the process hosted a web page.
pub fn is_http_page(page: &Page) -> bool {
    page.url.starts_with("http")
}

/// Threads of every process that hosted at least one matching page.
pub fn select_threads<'a, F>(
    doc: &'a TraceDocument,
    filter: F,
) -> Vec<(&'a SubprocessRecord, &'a Thread)>
where
    F: Fn(&Page) -> bool,
{
    doc.processes
        .iter()
        .filter(|process| {
            process
                .pages
                .as_deref()
                .map_or(false, |pages| pages.iter().any(&filter))
        })
        .flat_map(|process| process.threads.iter().map(move |t| (process, t)))
        .collect()
}

/// Attribute every qualifying sample in `doc`, adding to `counter`.
///
/// The counter is only touched when the whole document analyses cleanly, so a
/// corrupt trace contributes nothing.
pub fn analyze_document<F>(
    doc: &TraceDocument,
    filter: F,
    counter: &mut ApiCounter,
) -> Result<AnalysisStats, TraceError>
where
    F: Fn(&Page) -> bool,
{
    let mut local = ApiCounter::new();
    let mut stats = AnalysisStats::default();

    for (process, thread) in select_threads(doc, filter) {
        let pages: HashMap<u64, &Page> = process
            .pages
            .iter()
            .flatten()
            .map(|p| (p.inner_window_id, p))
            .collect();
        let view = ThreadView::new(thread, &doc.meta.categories)?;
        let analyzer = ThreadAnalyzer {
            view: &view,
            pages: &pages,
        };
        stats.threads += 1;
        stats.samples += view.sample_count();
        stats.recorded += analyzer.run(&mut local)?;
    }

    debug!(
        threads = stats.threads,
        samples = stats.samples,
        recorded = stats.recorded,
        "analysed trace"
    );
    counter.merge(local);
    Ok(stats)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolve {
    /// First JavaScript ancestor, whatever its label holds
    NearestScript,
    /// First JavaScript ancestor whose label holds an absolute URL
    NearestValidUrl,
}

/// A resolved script location: the URL and the stack it was read from.
struct ScriptHit<'a> {
    url: Option<&'a str>,
    stack: usize,
}

struct ThreadAnalyzer<'v, 'a> {
    view: &'v ThreadView<'a>,
    pages: &'v HashMap<u64, &'a Page>,
}

impl<'v, 'a> ThreadAnalyzer<'v, 'a> {
    fn run(&self, counter: &mut ApiCounter) -> Result<usize, TraceError> {
        let mut recorded = 0;
        for sample in 0..self.view.sample_count() {
            if let Some((key, api)) = self.attribute(sample)? {
                counter.record(key, api);
                recorded += 1;
            }
        }
        Ok(recorded)
    }

    fn attribute(&self, sample: usize) -> Result<Option<(SourceKey, &'a str)>, TraceError> {
        let Some(stack) = self.view.sample_stack(sample)? else {
            return Ok(None);
        };
        // the root sentinel carries no frame
        let Some(caller) = self.view.parent_of(stack)? else {
            return Ok(None);
        };
        let api = self.view.label_of(self.view.frame_of(stack)?)?;
        if !is_dom_call(api) || !self.is_page_script(caller)? {
            return Ok(None);
        }

        let script = self.find_script(stack, Resolve::NearestScript)?;
        let valid = self.find_script(stack, Resolve::NearestValidUrl)?;
        let script_url = script.and_then(|hit| hit.url);
        let valid_url = valid.as_ref().and_then(|hit| hit.url);
        if script_url.map_or(false, is_internal_url) || valid_url.map_or(false, is_internal_url) {
            return Ok(None);
        }

        let owner = valid.map_or(caller, |hit| hit.stack);
        let (first_party, third_party) = self.parties(owner)?;

        let key = SourceKey {
            first_party: first_party.map(str::to_string),
            third_party: third_party.map(str::to_string),
            script_url: script_url.map(str::to_string),
            valid_script_url: valid_url.map(str::to_string),
        };
        Ok(Some((key, api)))
    }

    /// The direct caller must be non-root page JavaScript, not automation glue.
    fn is_page_script(&self, caller: usize) -> Result<bool, TraceError> {
        if self.view.is_root(caller)? {
            return Ok(false);
        }
        let frame = self.view.frame_of(caller)?;
        if self.view.category_name_of(frame)? != Some(JAVASCRIPT) {
            return Ok(false);
        }
        Ok(!is_automation_frame(self.view.label_of(frame)?))
    }

    /// Walk ancestors of `stack` (excluding it and the root) for a script location.
    fn find_script(
        &self,
        stack: usize,
        mode: Resolve,
    ) -> Result<Option<ScriptHit<'a>>, TraceError> {
        let mut current = stack;
        let mut steps = 0;
        loop {
            let Some(parent) = self.view.parent_of(current)? else {
                return Ok(None);
            };
            if self.view.is_root(parent)? {
                return Ok(None);
            }
            steps += 1;
            if steps > self.view.stack_count() {
                return Err(TraceError::StackCycle { stack: parent });
            }
            current = parent;

            let frame = self.view.frame_of(parent)?;
            if self.view.category_name_of(frame)? != Some(JAVASCRIPT) {
                continue;
            }
            let url = script_url_from_label(self.view.label_of(frame)?);
            match mode {
                Resolve::NearestScript => return Ok(Some(ScriptHit { url, stack: parent })),
                Resolve::NearestValidUrl => {
                    if let Some(url) = url.filter(|u| is_valid_url(u)) {
                        return Ok(Some(ScriptHit {
                            url: Some(url),
                            stack: parent,
                        }));
                    }
                }
            }
        }
    }

    /// (first party, third party) for the page owning `stack`'s frame.
    fn parties(&self, stack: usize) -> Result<(Option<&'a str>, Option<&'a str>), TraceError> {
        let frame = self.view.frame_of(stack)?;
        let Some(page) = self
            .view
            .window_of(frame)?
            .and_then(|w| self.pages.get(&w).copied())
        else {
            return Ok((None, None));
        };
        let chain = embedding_chain(self.pages, page)?;
        Ok((chain.last().copied(), chain.first().copied()))
    }
}

/// Page URLs from `page` outward to its top-level page.
///
/// The walk stops early at an embedder that was never recorded.
pub fn embedding_chain<'a>(
    pages: &HashMap<u64, &'a Page>,
    page: &'a Page,
) -> Result<Vec<&'a str>, TraceError> {
    let mut chain = vec![page.url.as_str()];
    let mut current = page;
    while let Some(embedder) = current.embedder() {
        let Some(parent) = pages.get(&embedder).copied() else {
            debug!(window = embedder, "embedder page not recorded");
            break;
        };
        if chain.len() > pages.len() {
            return Err(TraceError::EmbedderCycle { window: embedder });
        }
        chain.push(parent.url.as_str());
        current = parent;
    }
    Ok(chain)
}
