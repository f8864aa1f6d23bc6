use crate::types::{Destination, RecordKind, SECTOR_SIZE};
use anyhow::{anyhow, Context, Result};
use crc32c::crc32c;
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub(crate) const FILE_MAGIC: &[u8; 8] = b"TGBUF002";
pub(crate) const FILE_VERSION: u32 = 2;
pub(crate) const FILE_HEADER_LEN: usize = 64;

/// Fixed 64-byte spool-file header. Payload is a tight array of sector
/// payloads in chain order; only the final sector may be partial, so the fill
/// of every sector derives from `record_count`.
#[derive(Debug, Clone)]
pub(crate) struct FileHeader {
    pub sensor_id: u32,
    pub dest: Destination,
    pub kind: RecordKind,
    pub emergency: bool,
    pub seq: u64,
    pub record_count: u32,
    pub sector_count: u32,
    pub created_utc_ms: u64,
    pub checksum: u32,
}

pub(crate) fn data_file_name(sensor_id: u32, seq: u64) -> String {
    format!("sensor_{sensor_id}_seq_{seq}.dat")
}

pub(crate) fn emergency_file_name(sensor_id: u32, seq: u64) -> String {
    format!("sensor_{sensor_id}_seq_{seq}.emergency")
}

/// Parses `sensor_<id>_seq_<N>.dat` / `.emergency`.
pub(crate) fn parse_file_name(name: &str) -> Option<(u32, u64, bool)> {
    let (stem, emergency) = if let Some(stem) = name.strip_suffix(".dat") {
        (stem, false)
    } else if let Some(stem) = name.strip_suffix(".emergency") {
        (stem, true)
    } else {
        return None;
    };
    let rest = stem.strip_prefix("sensor_")?;
    let (sensor, seq) = rest.split_once("_seq_")?;
    Some((sensor.parse().ok()?, seq.parse().ok()?, emergency))
}

pub(crate) fn tmp_path(path: &Path) -> PathBuf {
    let ext = path
        .extension()
        .and_then(|v| v.to_str())
        .unwrap_or_default();
    path.with_extension(format!("{ext}.tmp"))
}

fn encode_header(header: &FileHeader) -> [u8; FILE_HEADER_LEN] {
    let mut buf = [0u8; FILE_HEADER_LEN];
    buf[0..8].copy_from_slice(FILE_MAGIC);
    buf[8..12].copy_from_slice(&FILE_VERSION.to_le_bytes());
    buf[12..16].copy_from_slice(&(FILE_HEADER_LEN as u32).to_le_bytes());
    buf[16..20].copy_from_slice(&header.sensor_id.to_le_bytes());
    buf[20] = header.dest as u8;
    buf[21] = header.kind.as_u8();
    buf[22] = header.emergency as u8;
    buf[24..32].copy_from_slice(&header.seq.to_le_bytes());
    buf[32..36].copy_from_slice(&header.record_count.to_le_bytes());
    buf[36..40].copy_from_slice(&header.sector_count.to_le_bytes());
    buf[40..48].copy_from_slice(&header.created_utc_ms.to_le_bytes());
    buf[48..52].copy_from_slice(&header.checksum.to_le_bytes());
    buf
}

fn decode_header(buf: &[u8]) -> Result<FileHeader> {
    if buf.len() < FILE_HEADER_LEN {
        return Err(anyhow!("header truncated"));
    }
    if &buf[0..8] != FILE_MAGIC {
        return Err(anyhow!("bad magic"));
    }
    let version = u32::from_le_bytes(buf[8..12].try_into().unwrap());
    if version != FILE_VERSION {
        return Err(anyhow!("unsupported version {version}"));
    }
    let header_len = u32::from_le_bytes(buf[12..16].try_into().unwrap());
    if header_len as usize != FILE_HEADER_LEN {
        return Err(anyhow!("unexpected header length {header_len}"));
    }
    let dest = Destination::from_u8(buf[20]).ok_or_else(|| anyhow!("bad destination"))?;
    let kind = RecordKind::from_u8(buf[21]).ok_or_else(|| anyhow!("bad record kind"))?;
    Ok(FileHeader {
        sensor_id: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
        dest,
        kind,
        emergency: buf[22] != 0,
        seq: u64::from_le_bytes(buf[24..32].try_into().unwrap()),
        record_count: u32::from_le_bytes(buf[32..36].try_into().unwrap()),
        sector_count: u32::from_le_bytes(buf[36..40].try_into().unwrap()),
        created_utc_ms: u64::from_le_bytes(buf[40..48].try_into().unwrap()),
        checksum: u32::from_le_bytes(buf[48..52].try_into().unwrap()),
    })
}

/// Atomic create: write to `<name>.tmp`, fsync, rename to the final name.
/// Returns the file size in bytes.
pub(crate) fn write_file(
    path: &Path,
    mut header: FileHeader,
    sectors: &[[u8; SECTOR_SIZE]],
) -> Result<u64> {
    let mut payload = Vec::with_capacity(sectors.len() * SECTOR_SIZE);
    for sector in sectors {
        payload.extend_from_slice(sector);
    }
    header.sector_count = sectors.len() as u32;
    header.checksum = crc32c(&payload);

    let tmp = tmp_path(path);
    let mut file = fs::OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(&tmp)
        .with_context(|| format!("create {}", tmp.display()))?;
    file.write_all(&encode_header(&header))?;
    file.write_all(&payload)?;
    file.sync_data()
        .with_context(|| format!("sync {}", tmp.display()))?;
    drop(file);
    fs::rename(&tmp, path)
        .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
    Ok((FILE_HEADER_LEN + payload.len()) as u64)
}

/// Reads and checksums a whole spool file.
pub(crate) fn read_file(path: &Path) -> Result<(FileHeader, Vec<[u8; SECTOR_SIZE]>)> {
    let raw = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let header = decode_header(&raw)?;
    let payload = &raw[FILE_HEADER_LEN..];
    if payload.len() != header.sector_count as usize * SECTOR_SIZE {
        return Err(anyhow!(
            "payload length {} does not match {} sectors",
            payload.len(),
            header.sector_count
        ));
    }
    if crc32c(payload) != header.checksum {
        return Err(anyhow!("payload checksum mismatch"));
    }
    let sectors = payload
        .chunks_exact(SECTOR_SIZE)
        .map(|chunk| {
            let mut buf = [0u8; SECTOR_SIZE];
            buf.copy_from_slice(chunk);
            buf
        })
        .collect();
    Ok((header, sectors))
}

/// Header + checksum validation without keeping the payload around.
pub(crate) fn verify_file(path: &Path) -> Result<FileHeader> {
    read_file(path).map(|(header, _)| header)
}

/// Random access to one sector payload via a seek into an open file.
pub(crate) fn read_sector_at(file: &mut fs::File, index: u16) -> Result<[u8; SECTOR_SIZE]> {
    file.seek(SeekFrom::Start(
        FILE_HEADER_LEN as u64 + index as u64 * SECTOR_SIZE as u64,
    ))?;
    let mut buf = [0u8; SECTOR_SIZE];
    file.read_exact(&mut buf).context("short sector read")?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn header(record_count: u32) -> FileHeader {
        FileHeader {
            sensor_id: 5,
            dest: Destination::Telemetry,
            kind: RecordKind::Tsd,
            emergency: false,
            seq: 3,
            record_count,
            sector_count: 0,
            created_utc_ms: 1_700_000_000_000,
            checksum: 0,
        }
    }

    #[test]
    fn file_name_roundtrip() {
        assert_eq!(parse_file_name(&data_file_name(7, 12)), Some((7, 12, false)));
        assert_eq!(
            parse_file_name(&emergency_file_name(7, 12)),
            Some((7, 12, true))
        );
        assert_eq!(parse_file_name("sensor_7_seq_12.dat.tmp"), None);
        assert_eq!(parse_file_name("journal.log"), None);
    }

    #[test]
    fn write_read_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(data_file_name(5, 3));
        let sectors = [[0xAAu8; SECTOR_SIZE], [0x55u8; SECTOR_SIZE]];
        let size = write_file(&path, header(10), &sectors).unwrap();
        assert_eq!(size, (FILE_HEADER_LEN + 2 * SECTOR_SIZE) as u64);
        assert!(!tmp_path(&path).exists());

        let (decoded, payloads) = read_file(&path).unwrap();
        assert_eq!(decoded.sensor_id, 5);
        assert_eq!(decoded.seq, 3);
        assert_eq!(decoded.record_count, 10);
        assert_eq!(decoded.sector_count, 2);
        assert_eq!(payloads.len(), 2);
        assert_eq!(payloads[0], [0xAAu8; SECTOR_SIZE]);

        let mut file = fs::File::open(&path).unwrap();
        assert_eq!(read_sector_at(&mut file, 1).unwrap(), [0x55u8; SECTOR_SIZE]);
    }

    #[test]
    fn flipped_byte_fails_checksum() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(data_file_name(5, 3));
        write_file(&path, header(6), &[[1u8; SECTOR_SIZE]]).unwrap();

        let mut raw = fs::read(&path).unwrap();
        raw[FILE_HEADER_LEN + 4] ^= 0xFF;
        fs::write(&path, raw).unwrap();

        assert!(verify_file(&path).is_err());
    }

    #[test]
    fn truncated_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(data_file_name(5, 3));
        write_file(&path, header(6), &[[1u8; SECTOR_SIZE]]).unwrap();
        let raw = fs::read(&path).unwrap();
        fs::write(&path, &raw[..raw.len() - 7]).unwrap();
        assert!(verify_file(&path).is_err());
    }
}
