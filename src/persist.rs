//! Persisted state (spec §6): the taker's used-commitment log, the
//! maker's commitment blacklist, self-exclusion nick files, and the
//! CoinJoin history CSV. Writers serialize through a single owner (spec
//! §5, §9 "Global mutable state"); readers see last-durable snapshots.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CommitmentRecord {
    pub commitment_hash: String,
    pub nums_index: u8,
    pub utxo_outpoint: String,
    pub first_used_at: u64,
}

/// Taker-side `cmtdata/commitments.json`: commitments already used, kept
/// to avoid reuse against the same maker (spec scenario 4).
pub struct TakerCommitmentStore {
    path: PathBuf,
    used: Vec<CommitmentRecord>,
}

impl TakerCommitmentStore {
    pub fn load(dir: &Path) -> std::io::Result<Self> {
        let path = dir.join("commitments.json");
        let used = if path.exists() {
            let contents = fs::read_to_string(&path)?;
            serde_json::from_str(&contents).unwrap_or_default()
        } else {
            Vec::new()
        };
        Ok(TakerCommitmentStore { path, used })
    }

    pub fn has_used(&self, commitment_hash: &str) -> bool {
        self.used.iter().any(|r| r.commitment_hash == commitment_hash)
    }

    pub fn record(&mut self, record: CommitmentRecord) -> std::io::Result<()> {
        self.used.push(record);
        self.flush()
    }

    fn flush(&self) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.used)?;
        fs::write(&self.path, json)
    }
}

/// Maker-side `cmtdata/commitmentlist`: append-only, line-per-commitment
/// blacklist, network-propagated via `!hp2`. A commitment may be
/// consumed (reveal or blacklist entry) at most once per maker (spec §3
/// invariants).
pub struct MakerBlacklist {
    path: PathBuf,
    entries: HashSet<String>,
}

impl MakerBlacklist {
    pub fn load(dir: &Path) -> std::io::Result<Self> {
        let path = dir.join("commitmentlist");
        let mut entries = HashSet::new();
        if path.exists() {
            let file = File::open(&path)?;
            for line in BufReader::new(file).lines() {
                let line = line?;
                if !line.trim().is_empty() {
                    entries.insert(line.trim().to_string());
                }
            }
        }
        Ok(MakerBlacklist { path, entries })
    }

    pub fn contains(&self, commitment_hash: &str) -> bool {
        self.entries.contains(commitment_hash)
    }

    /// Append-only write, serialized through this owner task (spec §5).
    pub fn append(&mut self, commitment_hash: &str) -> std::io::Result<bool> {
        if self.entries.contains(commitment_hash) {
            return Ok(false);
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "{commitment_hash}")?;
        self.entries.insert(commitment_hash.to_string());
        Ok(true)
    }
}

/// `state/<role>.nick`: written at run start, deleted on clean shutdown.
/// Read back by the registry to exclude the operator's own maker nick
/// from selection (spec §4.3 filter step (iv)).
pub struct NickFile {
    path: PathBuf,
}

impl NickFile {
    pub fn new(state_dir: &Path, role: &str) -> Self {
        NickFile {
            path: state_dir.join(format!("{role}.nick")),
        }
    }

    pub fn write(&self, nick: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, nick)
    }

    pub fn read(&self) -> Option<String> {
        fs::read_to_string(&self.path).ok().map(|s| s.trim().to_string())
    }

    pub fn clear(&self) -> std::io::Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

/// `state/ignored_makers`: persisted alongside the nick file, feeding
/// filter step (i) of maker selection.
pub fn load_ignored_makers(state_dir: &Path) -> Vec<String> {
    let path = state_dir.join("ignored_makers");
    match fs::read_to_string(path) {
        Ok(contents) => contents.lines().map(|l| l.trim().to_string()).filter(|l| !l.is_empty()).collect(),
        Err(_) => Vec::new(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: u64,
    pub run_id: String,
    pub txid: String,
    pub amount: u64,
    pub counterparty_count: usize,
    pub success: bool,
}

/// `coinjoin_history.csv`: append-and-update-on-confirmation.
pub struct History {
    path: PathBuf,
}

impl History {
    pub fn new(path: PathBuf) -> Self {
        History { path }
    }

    pub fn append(&self, entry: &HistoryEntry) -> std::io::Result<()> {
        let needs_header = !self.path.exists();
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(needs_header)
            .from_writer(file);
        writer
            .serialize(entry)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        writer.flush()
    }

    /// Rewrite the row for `run_id`, flipping its success flag once the
    /// broadcast confirms.
    pub fn mark_success(&self, run_id: &str) -> std::io::Result<()> {
        if !self.path.exists() {
            return Ok(());
        }
        let mut reader = csv::Reader::from_path(&self.path)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        let mut rows: Vec<HistoryEntry> = reader
            .deserialize()
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        for row in rows.iter_mut() {
            if row.run_id == run_id {
                row.success = true;
            }
        }
        let mut writer = csv::Writer::from_path(&self.path)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        for row in &rows {
            writer
                .serialize(row)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        }
        writer.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commitment_reuse_detected_after_record() {
        let dir = tempdir();
        let mut store = TakerCommitmentStore::load(&dir).unwrap();
        assert!(!store.has_used("abc"));
        store
            .record(CommitmentRecord {
                commitment_hash: "abc".into(),
                nums_index: 0,
                utxo_outpoint: "txid:0".into(),
                first_used_at: 0,
            })
            .unwrap();
        assert!(store.has_used("abc"));

        let reloaded = TakerCommitmentStore::load(&dir).unwrap();
        assert!(reloaded.has_used("abc"));
    }

    #[test]
    fn maker_blacklist_rejects_second_submission() {
        let dir = tempdir();
        let mut bl = MakerBlacklist::load(&dir).unwrap();
        assert!(bl.append("deadbeef").unwrap());
        assert!(!bl.append("deadbeef").unwrap());
        assert!(bl.contains("deadbeef"));
    }

    #[test]
    fn nick_file_written_and_cleared() {
        let dir = tempdir();
        let nf = NickFile::new(&dir, "taker");
        nf.write("J5abc").unwrap();
        assert_eq!(nf.read().as_deref(), Some("J5abc"));
        nf.clear().unwrap();
        assert_eq!(nf.read(), None);
    }

    fn tempdir() -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("joinswap-test-{}", std::process::id()));
        dir.push(format!("{:?}", std::thread::current().id()).replace(['(', ')'], ""));
        let _ = fs::create_dir_all(&dir);
        dir
    }
}
