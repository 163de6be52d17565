//! Labelled counter dimensions for the reporting layer.
//!
//! An [`Indexer`] is a restartable finite label stream: `restart` resets the
//! cursor and returns the expected cardinality, then `next_label` yields
//! `(index, label)` pairs until it is exhausted. The reporting call site
//! instantiates one per dimension and hands it to whatever formatter renders
//! the counters; nothing here does any rendering.

/// A restartable finite stream of `(index, label)` pairs.
pub trait Indexer {
    /// Name of the dimension this indexer labels.
    fn name(&self) -> &'static str;

    /// Reset the cursor and return the expected number of labels.
    fn restart(&mut self) -> usize;

    /// The next `(index, label)` pair, or `None` once exhausted.
    fn next_label(&mut self) -> Option<(usize, String)>;
}

/// Labels the interface dimension of the capture statistics.
#[derive(Debug, Clone)]
pub struct InterfaceNameIndexer {
    names: Vec<String>,
    cursor: usize,
}

impl InterfaceNameIndexer {
    pub fn new(names: Vec<String>) -> Self {
        Self { names, cursor: 0 }
    }
}

impl Indexer for InterfaceNameIndexer {
    fn name(&self) -> &'static str {
        "ifname"
    }

    fn restart(&mut self) -> usize {
        self.cursor = 0;
        self.names.len()
    }

    fn next_label(&mut self) -> Option<(usize, String)> {
        let label = self.names.get(self.cursor)?.clone();
        let index = self.cursor;
        self.cursor += 1;
        Some((index, label))
    }
}

const CAPTURE_STAT_LABELS: [&str; 3] = ["pkts_captured", "filter_received", "kernel_dropped"];

/// Labels the per-interface capture counters.
#[derive(Debug, Clone, Default)]
pub struct CaptureStatIndexer {
    cursor: usize,
}

impl CaptureStatIndexer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Indexer for CaptureStatIndexer {
    fn name(&self) -> &'static str {
        "pcap_stat"
    }

    fn restart(&mut self) -> usize {
        self.cursor = 0;
        CAPTURE_STAT_LABELS.len()
    }

    fn next_label(&mut self) -> Option<(usize, String)> {
        let label = CAPTURE_STAT_LABELS.get(self.cursor)?.to_string();
        let index = self.cursor;
        self.cursor += 1;
        Some((index, label))
    }
}

/// The bits of a parsed DNS message the EDNS indexer classifies on,
/// provided by the downstream DNS parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DnsIndicators {
    pub malformed: bool,
    /// EDNS version when an OPT record is present.
    pub edns_version: Option<u8>,
}

/// Buckets DNS messages by EDNS version with a dynamic high-water mark:
/// bucket 0 is "no EDNS", bucket `v + 1` is EDNS version `v`; malformed
/// messages are unclassifiable.
#[derive(Debug, Clone, Default)]
pub struct EdnsVersionIndexer {
    max_index: usize,
    cursor: usize,
}

impl EdnsVersionIndexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bucket index for one message; `None` when it is malformed.
    pub fn classify(&mut self, indicators: &DnsIndicators) -> Option<usize> {
        if indicators.malformed {
            return None;
        }
        let index = match indicators.edns_version {
            None => 0,
            Some(version) => version as usize + 1,
        };
        if index > self.max_index {
            self.max_index = index;
        }
        Some(index)
    }
}

impl Indexer for EdnsVersionIndexer {
    fn name(&self) -> &'static str {
        "edns_version"
    }

    fn restart(&mut self) -> usize {
        self.cursor = 0;
        self.max_index + 1
    }

    fn next_label(&mut self) -> Option<(usize, String)> {
        if self.cursor > self.max_index {
            return None;
        }
        let index = self.cursor;
        let label = if index == 0 {
            "none".to_string()
        } else {
            (index - 1).to_string()
        };
        self.cursor += 1;
        Some((index, label))
    }
}
