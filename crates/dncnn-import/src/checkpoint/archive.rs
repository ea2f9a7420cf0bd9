use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read, Seek};
use std::path::Path;

use zip::ZipArchive;

use super::CheckpointError;

const ZIP_MAGIC: [u8; 4] = *b"PK\x03\x04";

/// The pickled object graph of a checkpoint together with its raw tensor storages.
#[derive(Debug)]
pub struct TorchArchive {
    /// Directory prefix shared by every record, usually `archive` or the file stem.
    pub root: String,
    pub pickle: Vec<u8>,
    /// Storage bytes keyed by storage name (the file name under `<root>/data/`).
    pub storages: HashMap<String, Vec<u8>>,
}

impl TorchArchive {
    pub fn open(path: &Path) -> Result<Self, CheckpointError> {
        let mut file = File::open(path)?;

        let mut magic = [0u8; 4];
        let read = file.read(&mut magic)?;
        if read < magic.len() || magic != ZIP_MAGIC {
            return Err(CheckpointError::UnsupportedEncoding(format!(
                "{} is not a zip archive; checkpoints written with the legacy (pre 1.6) torch.save encoding are not supported",
                path.display()
            )));
        }
        file.rewind()?;

        let mut archive = ZipArchive::new(BufReader::new(file))?;
        let mut root = None;
        let mut pickle = Vec::new();
        let mut storages = HashMap::new();

        // Records are few and small next to the storages; read everything once.
        for i in 0..archive.len() {
            let mut record = archive.by_index(i)?;
            let name = record.name().to_string();

            if let Some(prefix) = name.strip_suffix("data.pkl") {
                if root.is_none() {
                    record.read_to_end(&mut pickle)?;
                    root = Some(prefix.trim_end_matches('/').to_string());
                }
            } else if let Some((_, key)) = name.rsplit_once("/data/") {
                let mut bytes = Vec::with_capacity(record.size() as usize);
                record.read_to_end(&mut bytes)?;
                storages.insert(key.to_string(), bytes);
            } else if name.ends_with("/byteorder") {
                let mut order = String::new();
                record.read_to_string(&mut order)?;
                if order.trim() != "little" {
                    return Err(CheckpointError::UnsupportedEncoding(format!(
                        "storages are stored with '{}' byte order",
                        order.trim()
                    )));
                }
            }
        }

        let root = root.ok_or_else(|| {
            CheckpointError::UnknownFormat(format!(
                "zip archive {} holds no data.pkl record",
                path.display()
            ))
        })?;
        log::debug!(
            "Read archive '{}' with {} storages",
            root,
            storages.len()
        );

        Ok(Self {
            root,
            pickle,
            storages,
        })
    }
}
