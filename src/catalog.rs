//! The syscall catalog: number<->name resolution and per-syscall argument
//! schemas.

use std::collections::HashMap;

use lazy_static::lazy_static;

/// Upper bound on a hijacked path's length, and the size of the per-argument
/// scratch region reserved below the tracee's stack pointer.
pub const MAX_PATH: usize = 256;

/// Sentinel name returned for a syscall number the catalog has no entry
/// for.
pub const UNKNOWN_SYSCALL: &str = "N/A";

/// The embedded `number abi name` text table, in the same shape as the
/// kernel's `arch/x86/entry/syscalls/syscall_64.tbl`.
const SYSCALL_TABLE_TXT: &str = include_str!("assets/syscall_64.tbl");

/// The type tag carried by one argument or return descriptor. Closed sum
/// type: dispatch on the tag drives decoding, display, hijack and restore
/// behavior with no string comparisons in the hot path.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ArgTag {
    Err,
    SErr,
    Ptr,
    FInt,
    FSize,
    FLen,
    FPtr,
    FCstr,
    FDirp,
    FFd,
    FPath,
    FFlag,
    FMode,
    AtFd,
    FStatp,
    FFcntlCmd,
    FSysc,
}

impl ArgTag {
    fn parse(tag: &str) -> Option<ArgTag> {
        Some(match tag {
            "err" => ArgTag::Err,
            "serr" => ArgTag::SErr,
            "ptr" => ArgTag::Ptr,
            "f_int" => ArgTag::FInt,
            "f_size" => ArgTag::FSize,
            "f_len" => ArgTag::FLen,
            "f_ptr" => ArgTag::FPtr,
            "f_cstr" => ArgTag::FCstr,
            "f_dirp" => ArgTag::FDirp,
            "f_fd" => ArgTag::FFd,
            "f_path" => ArgTag::FPath,
            "f_flag" => ArgTag::FFlag,
            "f_mode" => ArgTag::FMode,
            "at_fd" => ArgTag::AtFd,
            "f_statp" => ArgTag::FStatp,
            "f_fcntlcmd" => ArgTag::FFcntlCmd,
            "f_sysc" => ArgTag::FSysc,
            _ => return None,
        })
    }

    /// Whether this variant dereferences a tracee pointer to a
    /// NUL-terminated string (`str`) or is carried by value (`int`).
    pub fn is_str(self) -> bool {
        matches!(self, ArgTag::FCstr | ArgTag::FPath)
    }
}

/// One argument or return-value descriptor: a local name plus its type tag.
#[derive(Clone, Debug)]
pub struct Descriptor {
    pub name: String,
    pub tag: ArgTag,
}

impl Descriptor {
    /// Parses `"type-tag"` or `"local-name:type-tag"`. Unknown tags are
    /// rejected (a schema-authoring bug, not a runtime condition).
    fn parse(raw: &str) -> Descriptor {
        let (name, tag_str) = match raw.split_once(':') {
            Some((n, t)) => (n.to_string(), t),
            None => {
                let derived = match raw.split_once('_') {
                    Some((_, rest)) => rest.to_string(),
                    None => raw.to_string(),
                };
                (derived, raw)
            }
        };
        let tag = ArgTag::parse(tag_str)
            .unwrap_or_else(|| panic!("catalog: unknown type tag {:?} in descriptor {:?}", tag_str, raw));
        Descriptor { name, tag }
    }
}

/// The return descriptor plus ordered argument descriptors for one syscall.
#[derive(Clone, Debug, Default)]
pub struct Schema {
    pub ret: Option<Descriptor>,
    pub args: Vec<Descriptor>,
}

impl Schema {
    fn from_strs(entries: &[&str]) -> Schema {
        let mut iter = entries.iter();
        let ret = iter.next().map(|s| Descriptor::parse(s));
        let args = iter.map(|s| Descriptor::parse(s)).collect();
        Schema { ret, args }
    }

    /// The return descriptor, defaulting to a plain `err` when the schema
    /// doesn't declare one (unknown-syscall case).
    pub fn ret_or_default(&self) -> Descriptor {
        self.ret.clone().unwrap_or(Descriptor {
            name: "ret".to_string(),
            tag: ArgTag::Err,
        })
    }
}

/// `(syscall name, [return-descriptor, arg-descriptors...])` literal table.
const RAW_SCHEMAS: &[(&str, &[&str])] = &[
    ("open", &["f_fd", "f_path", "f_flag", "f_mode"]),
    ("openat", &["f_fd", "dirfd:at_fd", "f_path", "f_flag", "f_mode"]),
    ("close", &["err", "f_fd"]),
    ("getdents", &["f_len", "f_fd", "f_dirp", "f_size"]),
    ("getdents64", &["f_len", "f_fd", "f_dirp", "f_size"]),
    ("stat", &["err", "f_path", "f_statp"]),
    ("fstat", &["err", "f_fd", "f_statp"]),
    ("fstatat", &["err", "dirfd:at_fd", "f_path", "f_statp", "f_int"]),
    ("lstat", &["err", "f_path", "f_statp"]),
    ("unlink", &["err", "f_path"]),
    ("unlinkat", &["err", "dirfd:at_fd", "f_path", "f_int"]),
    ("getxattr", &["serr", "f_path", "f_cstr", "f_ptr", "f_int"]),
    ("access", &["err", "f_path", "f_int"]),
    ("faccessat", &["err", "dirfd:at_fd", "f_path", "f_int"]),
    ("chdir", &["err", "f_path"]),
    ("fchdir", &["err", "dirfd:at_fd"]),
    ("rename", &["err", "old:f_path", "new:f_path"]),
    (
        "renameat",
        &["err", "oldfd:f_fd", "old:f_path", "newfd:f_fd", "new:f_path"],
    ),
    ("fcntl", &["err", "f_fd", "f_fcntlcmd"]),
    ("readlink", &["f_len", "f_path", "f_ptr", "f_int"]),
    ("readlinkat", &["f_len", "dirfd:at_fd", "f_path", "f_ptr", "f_int"]),
    ("mkdir", &["err", "f_path", "f_mode"]),
    ("mkdirat", &["err", "dirfd:at_fd", "f_path", "f_mode"]),
    ("chmod", &["err", "f_path", "f_mode"]),
    ("fchmodat", &["err", "dirfd:at_fd", "f_path", "f_mode"]),
    ("creat", &["err", "f_path", "f_mode"]),
    ("chown", &["err", "f_path", "o:f_int", "g:f_int"]),
    ("fchownat", &["err", "dirfd:at_fd", "f_path", "o:f_int", "g:f_int"]),
    ("truncate", &["err", "f_path", "f_int"]),
    ("rmdir", &["err", "f_path"]),
    ("utimensat", &["err", "dirfd:at_fd", "f_path", "f_ptr", "f_int"]),
];

/// Syscalls whose schema is shared with a `new`-prefixed alias (the
/// kernel's `newstat`-family entry points).
const STAT_FAMILY_ALIASES: &[&str] = &["stat", "fstat", "lstat", "fstatat"];

lazy_static! {
    static ref SCHEMAS: HashMap<&'static str, Schema> = build_schemas();
}

fn build_schemas() -> HashMap<&'static str, Schema> {
    let mut map: HashMap<&'static str, Schema> = RAW_SCHEMAS
        .iter()
        .map(|(name, entries)| (*name, Schema::from_strs(entries)))
        .collect();
    for name in STAT_FAMILY_ALIASES {
        if let Some(schema) = map.get(name).cloned() {
            let aliased: &'static str = Box::leak(format!("new{}", name).into_boxed_str());
            map.insert(aliased, schema);
        }
    }
    map
}

/// Returns the schema for `name`, or the empty schema (no args, `err`
/// return) when `name` isn't cataloged.
pub fn schema_for(name: &str) -> Schema {
    SCHEMAS.get(name).cloned().unwrap_or_default()
}

/// Immutable bijective syscall-number <-> name table, loaded once from the
/// embedded `number abi name` text asset.
pub struct Catalog {
    num_to_name: HashMap<i64, String>,
    name_to_num: HashMap<String, i64>,
}

impl Catalog {
    /// Parses the embedded x86-64 syscall table. Comment lines (`#...`) and
    /// blank lines are ignored; only the `number` and `name` fields of each
    /// `number abi name` line are consumed. Duplicate numbers overwrite, in
    /// file order.
    pub fn load() -> Catalog {
        Self::parse(SYSCALL_TABLE_TXT)
    }

    /// Parses an arbitrary table in the same text format; exposed so
    /// callers (and tests) can load an alternate table without touching
    /// the embedded default.
    pub fn parse(text: &str) -> Catalog {
        let mut num_to_name = HashMap::new();
        let mut name_to_num = HashMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_whitespace();
            let (num, _abi, name) = match (fields.next(), fields.next(), fields.next()) {
                (Some(n), Some(a), Some(nm)) => (n, a, nm),
                _ => continue,
            };
            let num: i64 = match num.parse() {
                Ok(n) => n,
                Err(_) => continue,
            };
            num_to_name.insert(num, name.to_string());
            name_to_num.insert(name.to_string(), num);
        }
        Catalog { num_to_name, name_to_num }
    }

    /// Resolves a syscall number (as found in `orig_rax`) to its name, or
    /// `"N/A"` if unknown.
    pub fn name_for(&self, num: i64) -> &str {
        self.num_to_name
            .get(&num)
            .map(|s| s.as_str())
            .unwrap_or(UNKNOWN_SYSCALL)
    }

    /// Resolves a syscall name back to its number.
    pub fn num_for(&self, name: &str) -> Option<i64> {
        self.name_to_num.get(name).copied()
    }

    /// The schema registered for `name`, or the empty schema.
    pub fn schema_for(&self, name: &str) -> Schema {
        schema_for(name)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn schema_round_trip() {
        let cat = Catalog::load();
        for (&num, name) in cat.num_to_name.iter() {
            assert_eq!(cat.name_for(num), name.as_str());
            assert_eq!(cat.num_for(name), Some(num));
        }
    }

    #[test]
    fn unknown_syscall_is_na() {
        let cat = Catalog::load();
        assert_eq!(cat.name_for(999_999), UNKNOWN_SYSCALL);
        let schema = cat.schema_for(cat.name_for(999_999));
        assert!(schema.args.is_empty());
        assert_eq!(schema.ret_or_default().tag, ArgTag::Err);
    }

    #[test]
    fn stat_family_aliasing() {
        let fstatat = schema_for("fstatat");
        let newfstatat = schema_for("newfstatat");
        assert_eq!(fstatat.args.len(), newfstatat.args.len());
        for (a, b) in fstatat.args.iter().zip(newfstatat.args.iter()) {
            assert_eq!(a.name, b.name);
            assert_eq!(a.tag, b.tag);
        }
    }

    #[test]
    fn descriptor_name_derivation() {
        let openat = schema_for("openat");
        // dirfd:at_fd -> explicit name
        assert_eq!(openat.args[0].name, "dirfd");
        assert_eq!(openat.args[0].tag, ArgTag::AtFd);
        // f_path -> derived name "path"
        assert_eq!(openat.args[1].name, "path");
        assert_eq!(openat.args[1].tag, ArgTag::FPath);
    }

    #[test]
    fn argument_count_matches_schema_length() {
        let getdents = schema_for("getdents");
        assert_eq!(getdents.args.len(), 3);
    }

    #[test]
    fn duplicate_numbers_take_last_entry() {
        let cat = Catalog::parse("1 common open\n1 common read\n");
        assert_eq!(cat.name_for(1), "read");
    }
}
