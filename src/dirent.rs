//! Parser/emitter for the kernel's `linux_dirent` byte layout, as produced
//! and consumed by `getdents`/`getdents64`.

use std::convert::TryInto;
use std::path::Path;

use crate::error::{TraceError, TraceResult};

/// `d_ino (u64) + d_off (u64) + d_reclen (u16)`. Parser, packer and sizer
/// all agree on this header size.
pub const HEADER_SIZE: usize = 8 + 8 + 2;

/// `d_reclen` is always rounded up to a multiple of this.
pub const ALIGN: usize = 24;

pub const DT_UNKNOWN: u8 = 0;
pub const DT_FIFO: u8 = 1;
pub const DT_CHR: u8 = 2;
pub const DT_DIR: u8 = 4;
pub const DT_BLK: u8 = 6;
pub const DT_REG: u8 = 8;
pub const DT_LNK: u8 = 10;
pub const DT_SOCK: u8 = 14;

/// One `getdents` directory record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub d_ino: u64,
    pub d_off: u64,
    pub d_reclen: u16,
    pub d_name: Vec<u8>,
    pub d_type: u8,
}

impl DirEntry {
    /// Builds an entry with `d_reclen` computed from `d_name`'s length per
    /// the alignment invariant; a NUL + the `d_type` byte always fit.
    pub fn new(d_ino: u64, d_off: u64, d_name: impl Into<Vec<u8>>, d_type: u8) -> DirEntry {
        let d_name = d_name.into();
        let d_reclen = reclen_for(d_name.len());
        DirEntry {
            d_ino,
            d_off,
            d_reclen,
            d_name,
            d_type,
        }
    }

    /// Packs one record: header + name + NUL padding up to `d_reclen - 1`,
    /// then the `d_type` byte at `d_reclen - 1`.
    pub fn pack(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.d_reclen as usize);
        buf.extend_from_slice(&self.d_ino.to_le_bytes());
        buf.extend_from_slice(&self.d_off.to_le_bytes());
        buf.extend_from_slice(&self.d_reclen.to_le_bytes());
        buf.extend_from_slice(&self.d_name);
        let pad_to = self.d_reclen as usize - 1;
        buf.resize(pad_to, 0);
        buf.push(self.d_type);
        buf
    }
}

/// Smallest multiple of [`ALIGN`] that can hold the header, `name_len`
/// bytes of name, a NUL terminator, and the trailing type byte.
pub fn reclen_for(name_len: usize) -> u16 {
    let minimum = HEADER_SIZE + name_len + 2;
    let rounded = ((minimum + ALIGN - 1) / ALIGN) * ALIGN;
    rounded as u16
}

/// Parses every record out of a contiguous `getdents` buffer.
pub fn parse_all(buf: &[u8]) -> TraceResult<Vec<DirEntry>> {
    let mut out = Vec::new();
    let mut off = 0usize;
    while off < buf.len() {
        let entry = parse_one(buf, off)?;
        off += entry.d_reclen as usize;
        out.push(entry);
    }
    Ok(out)
}

fn parse_one(buf: &[u8], beg: usize) -> TraceResult<DirEntry> {
    if beg + HEADER_SIZE > buf.len() {
        return Err(TraceError::DecodeError(format!(
            "dirent header truncated at offset {}",
            beg
        )));
    }
    let d_ino = u64::from_le_bytes(buf[beg..beg + 8].try_into().unwrap());
    let d_off = u64::from_le_bytes(buf[beg + 8..beg + 16].try_into().unwrap());
    let d_reclen = u16::from_le_bytes(buf[beg + 16..beg + 18].try_into().unwrap());
    if d_reclen as usize % ALIGN != 0 || (d_reclen as usize) < HEADER_SIZE + 2 {
        return Err(TraceError::DecodeError(format!(
            "dirent at offset {} has invalid d_reclen {}",
            beg, d_reclen
        )));
    }
    let end = beg + d_reclen as usize;
    if end > buf.len() {
        return Err(TraceError::DecodeError(format!(
            "dirent at offset {} overruns buffer (d_reclen {})",
            beg, d_reclen
        )));
    }
    let name_end = end - 1;
    let mut name = &buf[beg + HEADER_SIZE..name_end];
    while let [rest @ .., 0] = name {
        name = rest;
    }
    let d_type = buf[end - 1];
    Ok(DirEntry {
        d_ino,
        d_off,
        d_reclen,
        d_name: name.to_vec(),
        d_type,
    })
}

/// Packs a full list of records back-to-back, in order.
pub fn pack_all(entries: &[DirEntry]) -> Vec<u8> {
    let mut buf = Vec::new();
    for entry in entries {
        buf.extend_from_slice(&entry.pack());
    }
    buf
}

/// Maps an `st_mode` value to the `DT_*` code `getdents` would report for
/// it, via the `S_IS*` mode-bit family.
pub fn dtype_from_mode(mode: libc::mode_t) -> u8 {
    use libc::{S_IFBLK, S_IFCHR, S_IFDIR, S_IFIFO, S_IFLNK, S_IFMT, S_IFREG, S_IFSOCK};
    match mode & S_IFMT {
        S_IFBLK => DT_BLK,
        S_IFCHR => DT_CHR,
        S_IFDIR => DT_DIR,
        S_IFIFO => DT_FIFO,
        S_IFLNK => DT_LNK,
        S_IFREG => DT_REG,
        S_IFSOCK => DT_SOCK,
        _ => DT_UNKNOWN,
    }
}

/// Builds the record list for a real directory by `lstat`-ing each entry.
/// `d_off` starts at 1 and increments per entry; `d_ino` comes from the
/// underlying stat. Used by `ChrootPolicy` to synthesize `getdents` output
/// from the shadow tree.
pub fn list_dir(path: &Path) -> TraceResult<Vec<DirEntry>> {
    let mut out = Vec::new();
    let read_dir = std::fs::read_dir(path)
        .map_err(|e| TraceError::DecodeError(format!("read_dir {:?}: {}", path, e)))?;
    for (off, entry) in read_dir.enumerate() {
        let entry =
            entry.map_err(|e| TraceError::DecodeError(format!("read_dir entry: {}", e)))?;
        let name = entry.file_name();
        let stat = nix::sys::stat::lstat(&entry.path())
            .map_err(|e| TraceError::DecodeError(format!("lstat {:?}: {}", entry.path(), e)))?;
        out.push(DirEntry::new(
            stat.st_ino,
            (off + 1) as u64,
            name.to_string_lossy().into_owned().into_bytes(),
            dtype_from_mode(stat.st_mode),
        ));
    }
    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn reclen_is_aligned_and_sufficient() {
        for name_len in 0..40 {
            let reclen = reclen_for(name_len);
            assert_eq!(reclen as usize % ALIGN, 0);
            assert!(reclen as usize >= HEADER_SIZE + name_len + 2);
        }
    }

    #[test]
    fn round_trip_single_entry() {
        let entries = vec![DirEntry::new(42, 1, "hello".as_bytes(), DT_REG)];
        let packed = pack_all(&entries);
        let parsed = parse_all(&packed).unwrap();
        assert_eq!(parsed, entries);
    }

    #[test]
    fn round_trip_multiple_entries() {
        let entries = vec![
            DirEntry::new(1, 1, ".".as_bytes(), DT_DIR),
            DirEntry::new(2, 2, "..".as_bytes(), DT_DIR),
            DirEntry::new(3, 3, "a-much-longer-filename.txt".as_bytes(), DT_REG),
            DirEntry::new(4, 4, "".as_bytes(), DT_UNKNOWN),
        ];
        let packed = pack_all(&entries);
        let parsed = parse_all(&packed).unwrap();
        assert_eq!(parsed, entries);
    }

    #[test]
    fn rejects_truncated_header() {
        let buf = [0u8; 10];
        assert!(parse_all(&buf).is_err());
    }

    #[test]
    fn rejects_misaligned_reclen() {
        let mut entry = DirEntry::new(1, 1, "x".as_bytes(), DT_REG);
        entry.d_reclen += 1;
        let packed = entry.pack();
        assert!(parse_all(&packed).is_err());
    }

    #[test]
    fn dtype_mapping() {
        assert_eq!(dtype_from_mode(libc::S_IFREG), DT_REG);
        assert_eq!(dtype_from_mode(libc::S_IFDIR), DT_DIR);
        assert_eq!(dtype_from_mode(libc::S_IFLNK), DT_LNK);
    }

    #[test]
    fn list_dir_reflects_real_directory_contents() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        let entries = list_dir(dir.path()).unwrap();
        let names: Vec<String> = entries
            .iter()
            .map(|e| String::from_utf8_lossy(&e.d_name).into_owned())
            .collect();
        assert!(names.contains(&"a.txt".to_string()));
        assert!(names.contains(&"sub".to_string()));

        let file_entry = entries
            .iter()
            .find(|e| e.d_name == b"a.txt")
            .expect("a.txt entry present");
        assert_eq!(file_entry.d_type, DT_REG);
        let dir_entry = entries.iter().find(|e| e.d_name == b"sub").unwrap();
        assert_eq!(dir_entry.d_type, DT_DIR);

        let offsets: Vec<u64> = entries.iter().map(|e| e.d_off).collect();
        assert_eq!(offsets, (1..=entries.len() as u64).collect::<Vec<_>>());

        // What list_dir produces must itself round-trip through the codec.
        let packed = pack_all(&entries);
        let parsed = parse_all(&packed).unwrap();
        assert_eq!(parsed, entries);
    }
}
