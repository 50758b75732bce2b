//! Page-backed storage connection
//!
//! One active page mapped from a file, plus the series registry. The
//! pipeline worker is the only writer by construction; spouts call the
//! registry concurrently through [`Storage::series_to_param_id`].

use super::{Cursor, Durability, SeriesRegistry, Storage};
use crate::page::{PageFile, PageType, SearchStats, SearchStatsSnapshot, ENTRY_PREFIX_SIZE};
use crate::{config, Error, ParamId, Payload, Result, Sample, SearchQuery};
use parking_lot::Mutex;
use std::path::PathBuf;

/// Page store configuration
#[derive(Debug, Clone)]
pub struct PageStoreConfig {
    /// Backing file path
    pub path: PathBuf,
    /// Page size in bytes
    pub page_size: u64,
    /// Flush policy
    pub durability: Durability,
}

impl Default for PageStoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/emberdb.page"),
            page_size: config::DEFAULT_PAGE_SIZE,
            durability: Durability::default(),
        }
    }
}

/// Storage connection over a single mapped page.
///
/// `write` appends to the active page; `search` snapshots the page
/// state under the lock and materializes matching samples, so returned
/// cursors do not block later writes.
pub struct PageConnection {
    file: Mutex<PageFile>,
    registry: SeriesRegistry,
    durability: Durability,
    stats: SearchStats,
}

impl PageConnection {
    /// Create a fresh page file and connect to it
    pub fn create(config: &PageStoreConfig) -> Result<Self> {
        let file = PageFile::create(&config.path, config.page_size, PageType::Index, 0)?;
        Ok(Self {
            file: Mutex::new(file),
            registry: SeriesRegistry::new(),
            durability: config.durability,
            stats: SearchStats::default(),
        })
    }

    /// Connect to an existing page file. A corrupt header opens the
    /// page read-only; writes then fail with [`Error::Corruption`].
    pub fn open(config: &PageStoreConfig) -> Result<Self> {
        let file = PageFile::open(&config.path)?;
        Ok(Self {
            file: Mutex::new(file),
            registry: SeriesRegistry::new(),
            durability: config.durability,
            stats: SearchStats::default(),
        })
    }

    /// Series registry backing name resolution
    pub fn registry(&self) -> &SeriesRegistry {
        &self.registry
    }

    /// Aggregate search counters
    pub fn search_stats(&self) -> SearchStatsSnapshot {
        self.stats.snapshot()
    }

    /// Sort the active page index so searches run off the sorted prefix
    pub fn sort(&self) -> Result<()> {
        let mut file = self.file.lock();
        file.page_mut()?.sort();
        if self.durability == Durability::Durable {
            file.flush_header()?;
        }
        Ok(())
    }

    /// Flush the mapping to the backing file
    pub fn flush(&self) -> Result<()> {
        self.file.lock().flush()
    }

    /// Close the write session and sync the file
    pub fn close(&self) -> Result<()> {
        self.file.lock().close()
    }

    /// Copy the bytes a blob descriptor points at into `buf`, returning
    /// the payload length
    pub fn read_payload(&self, payload: Payload, buf: &mut [u8]) -> Result<usize> {
        match payload {
            Payload::Blob { len, offset } => {
                let file = self.file.lock();
                let page = file.page();
                let bytes = page.payload_at(offset, len)?;
                if buf.len() < bytes.len() {
                    return Err(Error::Overflow);
                }
                buf[..bytes.len()].copy_from_slice(bytes);
                Ok(bytes.len())
            }
            Payload::Float(_) => Err(Error::BadArg("payload is inline, not a descriptor".into())),
        }
    }
}

impl Storage for PageConnection {
    fn write(&self, sample: &Sample) -> Result<()> {
        let bytes = match sample.payload {
            Payload::Float(value) => value.to_ne_bytes(),
            Payload::Blob { .. } => {
                return Err(Error::BadArg("blob descriptors cannot be written back".into()))
            }
        };

        let mut file = self.file.lock();
        file.page_mut()?
            .add_entry(sample.param_id, sample.timestamp, &bytes)?;
        if self.durability == Durability::Durable {
            file.flush()?;
        }
        Ok(())
    }

    fn search(&self, query: SearchQuery) -> Result<Box<dyn Cursor + '_>> {
        let file = self.file.lock();
        let page = file.page();

        let mut cursor = page.search(query);
        let mut samples = Vec::new();
        while let Some(entry) = cursor.next() {
            samples.push(Sample {
                param_id: entry.param_id,
                timestamp: entry.timestamp,
                payload: Payload::Blob {
                    len: entry.payload.len() as u32,
                    offset: entry.offset + ENTRY_PREFIX_SIZE as u32,
                },
            });
        }
        self.stats.record(&cursor.probe_stats());

        Ok(Box::new(PageSearchCursor::new(samples)))
    }

    fn series_to_param_id(&self, name: &[u8]) -> Result<ParamId> {
        self.registry.get_or_create(name)
    }

    fn param_id_to_series(&self, id: ParamId, buf: &mut [u8]) -> Result<usize> {
        self.registry.reverse_into(id, buf)
    }
}

/// Cursor over materialized search results
struct PageSearchCursor {
    samples: Vec<Sample>,
    pos: usize,
    closed: bool,
}

impl PageSearchCursor {
    fn new(samples: Vec<Sample>) -> Self {
        Self {
            samples,
            pos: 0,
            closed: false,
        }
    }
}

impl Cursor for PageSearchCursor {
    fn read(&mut self, buf: &mut [Sample]) -> Result<usize> {
        if self.closed {
            return Err(Error::BadArg("cursor is closed".into()));
        }
        let n = buf.len().min(self.samples.len() - self.pos);
        buf[..n].copy_from_slice(&self.samples[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    fn is_done(&self) -> bool {
        self.closed || self.pos >= self.samples.len()
    }

    fn error(&self) -> Option<&Error> {
        None
    }

    fn close(&mut self) {
        self.closed = true;
        self.samples = Vec::new();
        self.pos = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{BackoffPolicy, IngestionPipeline, PipelineConfig};
    use std::io::Write;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir, durability: Durability) -> PageStoreConfig {
        PageStoreConfig {
            path: dir.path().join("test.page"),
            page_size: 64 * 1024,
            durability,
        }
    }

    fn drain(cursor: &mut dyn Cursor) -> Vec<Sample> {
        let mut out = Vec::new();
        let mut buf = [Sample::new(0, 0, 0.0); 7];
        while !cursor.is_done() {
            let n = cursor.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    #[test]
    fn test_write_sort_search() {
        let dir = TempDir::new().unwrap();
        let conn = PageConnection::create(&test_config(&dir, Durability::MaxWriteSpeed)).unwrap();

        for t in 0..50 {
            conn.write(&Sample::new(1, t, t as f64)).unwrap();
        }
        conn.sort().unwrap();

        let mut cursor = conn.search(SearchQuery::forward(1, 10, 20)).unwrap();
        let samples = drain(cursor.as_mut());
        assert_eq!(samples.len(), 11);
        let times: Vec<_> = samples.iter().map(|s| s.timestamp).collect();
        assert_eq!(times, (10..=20).collect::<Vec<_>>());
        assert!(cursor.is_done());
        assert!(cursor.error().is_none());
        cursor.close();
        let mut buf = [Sample::new(0, 0, 0.0); 1];
        assert!(matches!(cursor.read(&mut buf), Err(Error::BadArg(_))));

        let stats = conn.search_stats();
        assert_eq!(stats.searches, 1);
        assert_eq!(stats.matches, 11);
    }

    #[test]
    fn test_payloads_round_trip_through_descriptors() {
        let dir = TempDir::new().unwrap();
        let conn = PageConnection::create(&test_config(&dir, Durability::MaxWriteSpeed)).unwrap();

        conn.write(&Sample::new(9, 5, 2.75)).unwrap();
        conn.sort().unwrap();

        let mut cursor = conn.search(SearchQuery::forward(9, 0, 10)).unwrap();
        let samples = drain(cursor.as_mut());
        assert_eq!(samples.len(), 1);

        let mut buf = [0u8; 8];
        let n = conn.read_payload(samples[0].payload, &mut buf).unwrap();
        assert_eq!(n, 8);
        assert_eq!(f64::from_ne_bytes(buf), 2.75);

        // Too-small buffers negotiate instead of truncating.
        let mut tiny = [0u8; 4];
        assert!(matches!(
            conn.read_payload(samples[0].payload, &mut tiny),
            Err(Error::Overflow)
        ));
    }

    #[test]
    fn test_blob_samples_are_not_writable() {
        let dir = TempDir::new().unwrap();
        let conn = PageConnection::create(&test_config(&dir, Durability::MaxWriteSpeed)).unwrap();
        let sample = Sample {
            param_id: 1,
            timestamp: 0,
            payload: Payload::Blob { len: 8, offset: 100 },
        };
        assert!(matches!(conn.write(&sample), Err(Error::BadArg(_))));
    }

    #[test]
    fn test_durable_mode_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir, Durability::Durable);

        {
            let conn = PageConnection::create(&config).unwrap();
            for t in 0..10 {
                conn.write(&Sample::new(2, t, 0.5)).unwrap();
            }
            conn.close().unwrap();
        }

        let conn = PageConnection::open(&config).unwrap();
        let mut cursor = conn.search(SearchQuery::forward(2, 0, 100)).unwrap();
        assert_eq!(drain(cursor.as_mut()).len(), 10);
    }

    #[test]
    fn test_corrupt_page_rejects_writes() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir, Durability::MaxWriteSpeed);

        let mut f = std::fs::File::create(&config.path).unwrap();
        f.write_all(&[0xABu8; 4096]).unwrap();
        drop(f);

        let conn = PageConnection::open(&config).unwrap();
        assert!(matches!(
            conn.write(&Sample::new(1, 0, 1.0)),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn test_name_resolution() {
        let dir = TempDir::new().unwrap();
        let conn = PageConnection::create(&test_config(&dir, Durability::MaxWriteSpeed)).unwrap();

        let id = conn.series_to_param_id(b"host1.cpu").unwrap();
        assert_eq!(conn.series_to_param_id(b"host1.cpu").unwrap(), id);

        let mut buf = [0u8; 32];
        let n = conn.param_id_to_series(id, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"host1.cpu");
    }

    #[test]
    fn test_empty_search_is_done_immediately() {
        let dir = TempDir::new().unwrap();
        let conn = PageConnection::create(&test_config(&dir, Durability::MaxWriteSpeed)).unwrap();

        let mut cursor = conn.search(SearchQuery::forward(1, 0, 100)).unwrap();
        assert!(cursor.is_done());
        let mut buf = [Sample::new(0, 0, 0.0); 4];
        assert_eq!(cursor.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_pipeline_end_to_end() {
        let dir = TempDir::new().unwrap();
        let conn = Arc::new(
            PageConnection::create(&test_config(&dir, Durability::MaxWriteSpeed)).unwrap(),
        );

        let pipeline = IngestionPipeline::new(
            Arc::clone(&conn) as Arc<dyn Storage>,
            PipelineConfig {
                n_queues: 2,
                queue_capacity: 128,
                pool_size: 32,
                backoff: BackoffPolicy::LinearBackoff,
            },
        );
        pipeline.start().unwrap();

        let mut spout = pipeline.make_spout();
        let param = spout.series_to_param_id(b"bench.series").unwrap();
        for t in 0..1000 {
            assert!(spout.write(Sample::new(param, t, t as f64)));
        }
        pipeline.stop().unwrap();

        conn.sort().unwrap();
        let mut cursor = conn.search(SearchQuery::forward(param, 0, 999)).unwrap();
        let samples = drain(cursor.as_mut());
        assert_eq!(samples.len(), 1000);
        assert!(samples.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }
}
