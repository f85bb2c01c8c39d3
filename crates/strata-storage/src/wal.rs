//! Write-Ahead Log for the Open Block
//!
//! Samples accepted into the open block are appended here, so a crash loses at
//! most what the sync policy has not flushed yet.
//!
//! ## Generations
//!
//! The log is a sequence of files `wal/<generation>.wal`. Sealing rotates to a
//! new generation seeded with the samples that stay in the open block; once the
//! sealed block is on disk, older generations are released. Recovery replays
//! every generation in order. Samples already covered by a sealed block, or
//! repeated across two generations, are dropped by the normal out-of-order rule
//! of the Block Store.
//!
//! ## Record Format
//!
//! ```text
//! ┌─────────────┬───────────┬────────────┬───────────┬───────────┐
//! │ Payload len │ CRC32     │ Series key │ Timestamp │ Value     │
//! │ (4 bytes)   │ (4 bytes) │ (encoded)  │ (8 bytes) │ (8 bytes) │
//! └─────────────┴───────────┴────────────┴───────────┴───────────┘
//! ```
//!
//! A torn or corrupt record ends the replay of its file.

use std::path::{Path, PathBuf};
use std::time::Instant;

use bytes::{Buf, BufMut};
use strata_core::{Sample, SeriesKey};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::SyncPolicy;
use crate::error::Result;

const WAL_EXT: &str = "wal";
const HEADER_LEN: usize = 8;

#[derive(Debug)]
struct ActiveFile {
    file: File,
    generation: u64,
    last_sync: Instant,
    dirty: bool,
}

/// Write-ahead log of the Block Store's open block
#[derive(Debug)]
pub struct Wal {
    dir: PathBuf,
    sync_policy: SyncPolicy,
    active: Mutex<ActiveFile>,
}

impl Wal {
    /// Open the log in `dir`, returning every sample found in existing
    /// generations. Appends go to a fresh generation.
    pub async fn open(dir: PathBuf, sync_policy: SyncPolicy) -> Result<(Self, Vec<Sample>)> {
        tokio::fs::create_dir_all(&dir).await?;

        let generations = list_generations(&dir).await?;
        let mut recovered = Vec::new();
        for &(generation, ref path) in &generations {
            let samples = read_generation(path).await?;
            debug!(generation, samples = samples.len(), "Replayed WAL generation");
            recovered.extend(samples);
        }

        let next = generations.last().map_or(0, |(g, _)| g + 1);
        let file = create_generation(&dir, next).await?;
        if !recovered.is_empty() {
            info!(
                generations = generations.len(),
                samples = recovered.len(),
                "Recovered samples from write-ahead log"
            );
        }

        Ok((
            Self {
                dir,
                sync_policy,
                active: Mutex::new(ActiveFile {
                    file,
                    generation: next,
                    last_sync: Instant::now(),
                    dirty: false,
                }),
            },
            recovered,
        ))
    }

    pub async fn generation(&self) -> u64 {
        self.active.lock().await.generation
    }

    /// Append samples to the active generation
    pub async fn append(&self, samples: &[Sample]) -> Result<()> {
        if samples.is_empty() {
            return Ok(());
        }
        let data = encode_records(samples);

        let mut active = self.active.lock().await;
        active.file.write_all(&data).await?;
        active.file.flush().await?;
        active.dirty = true;

        let sync_now = match self.sync_policy {
            SyncPolicy::Always => true,
            SyncPolicy::Interval { interval } => active.last_sync.elapsed() >= interval,
            SyncPolicy::Never => false,
        };
        if sync_now {
            sync_active(&mut active).await?;
        }
        Ok(())
    }

    /// fsync pending appends, unless the policy is `Never`
    pub async fn sync(&self) -> Result<()> {
        if self.sync_policy == SyncPolicy::Never {
            return Ok(());
        }
        let mut active = self.active.lock().await;
        if active.dirty {
            sync_active(&mut active).await?;
        }
        Ok(())
    }

    /// Start a new generation holding `carried`, returning its number. Earlier
    /// generations stay on disk until [`Wal::release_before`].
    pub async fn rotate(&self, carried: &[Sample]) -> Result<u64> {
        let mut active = self.active.lock().await;
        if active.dirty && self.sync_policy != SyncPolicy::Never {
            sync_active(&mut active).await?;
        }

        let generation = active.generation + 1;
        let mut file = create_generation(&self.dir, generation).await?;
        if !carried.is_empty() {
            file.write_all(&encode_records(carried)).await?;
            file.flush().await?;
        }
        file.sync_data().await?;

        *active = ActiveFile {
            file,
            generation,
            last_sync: Instant::now(),
            dirty: false,
        };
        debug!(generation, carried = carried.len(), "WAL rotated");
        Ok(generation)
    }

    /// Delete generations older than `generation`
    pub async fn release_before(&self, generation: u64) -> Result<usize> {
        let mut released = 0;
        for (g, path) in list_generations(&self.dir).await? {
            if g >= generation {
                break;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => released += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        if released > 0 {
            debug!(released, before = generation, "WAL generations released");
        }
        Ok(released)
    }
}

async fn sync_active(active: &mut ActiveFile) -> Result<()> {
    active.file.sync_data().await?;
    active.last_sync = Instant::now();
    active.dirty = false;
    Ok(())
}

fn generation_path(dir: &Path, generation: u64) -> PathBuf {
    dir.join(format!("{:020}.{}", generation, WAL_EXT))
}

async fn create_generation(dir: &Path, generation: u64) -> Result<File> {
    Ok(OpenOptions::new()
        .create(true)
        .append(true)
        .open(generation_path(dir, generation))
        .await?)
}

/// WAL files in `dir`, oldest generation first
async fn list_generations(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut generations = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(WAL_EXT) {
            continue;
        }
        let Some(generation) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<u64>().ok())
        else {
            continue;
        };
        generations.push((generation, path));
    }
    generations.sort_by_key(|(g, _)| *g);
    Ok(generations)
}

fn encode_records(samples: &[Sample]) -> Vec<u8> {
    let mut out = Vec::new();
    for sample in samples {
        let mut payload = Vec::with_capacity(sample.key.encoded_len() + 16);
        sample.key.encode(&mut payload);
        payload.put_i64_le(sample.timestamp);
        payload.put_f64_le(sample.value);

        out.put_u32_le(payload.len() as u32);
        out.put_u32_le(crc32fast::hash(&payload));
        out.extend_from_slice(&payload);
    }
    out
}

async fn read_generation(path: &Path) -> Result<Vec<Sample>> {
    let data = tokio::fs::read(path).await?;
    let mut buf = data.as_slice();
    let mut samples = Vec::new();

    while buf.remaining() >= HEADER_LEN {
        let len = buf.get_u32_le() as usize;
        let crc = buf.get_u32_le();
        if buf.remaining() < len {
            warn!(path = %path.display(), "Torn record at end of WAL file");
            break;
        }
        let (payload, rest) = buf.split_at(len);
        buf = rest;

        if crc32fast::hash(payload) != crc {
            warn!(path = %path.display(), "WAL record checksum mismatch, stopping replay");
            break;
        }
        match decode_record(payload) {
            Some(sample) => samples.push(sample),
            None => {
                warn!(path = %path.display(), "Undecodable WAL record, stopping replay");
                break;
            }
        }
    }

    Ok(samples)
}

fn decode_record(mut payload: &[u8]) -> Option<Sample> {
    let key = SeriesKey::decode(&mut payload).ok()?;
    if payload.remaining() != 16 {
        return None;
    }
    let timestamp = payload.get_i64_le();
    let value = payload.get_f64_le();
    Some(Sample::new(key, timestamp, value))
}
