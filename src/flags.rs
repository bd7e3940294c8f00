//! `open(2)`/`openat(2)` flag bits and their symbolic display.
//!
//! Bit values come from `libc` rather than re-declared octal literals.

use libc::c_int;

pub const O_ACCMODE: c_int = libc::O_ACCMODE;
pub const O_RDONLY: c_int = libc::O_RDONLY;
pub const O_WRONLY: c_int = libc::O_WRONLY;
pub const O_RDWR: c_int = libc::O_RDWR;

/// `(symbol, bit)` pairs checked in display order, after the access-mode
/// triplet.
const NAMED_BITS: &[(&str, c_int)] = &[
    ("O_CREAT", libc::O_CREAT),
    ("O_EXCL", libc::O_EXCL),
    ("O_NOCTTY", libc::O_NOCTTY),
    ("O_TRUNC", libc::O_TRUNC),
    ("O_APPEND", libc::O_APPEND),
    ("O_NONBLOCK", libc::O_NONBLOCK),
    ("O_DSYNC", libc::O_DSYNC),
    ("O_DIRECT", libc::O_DIRECT),
    ("O_LARGEFILE", libc::O_LARGEFILE),
    ("O_DIRECTORY", libc::O_DIRECTORY),
    ("O_NOFOLLOW", libc::O_NOFOLLOW),
    ("O_NOATIME", libc::O_NOATIME),
    ("O_CLOEXEC", libc::O_CLOEXEC),
];

/// Decodes the access-mode + flag bits of an `open`/`openat` flags word
/// into its symbolic names, e.g. `"O_RDONLY"` or
/// `"O_WRONLY|O_CREAT|O_TRUNC"`.
pub fn display(flags: c_int) -> String {
    let mut parts = Vec::new();
    parts.push(match flags & O_ACCMODE {
        O_RDONLY => "O_RDONLY",
        O_WRONLY => "O_WRONLY",
        O_RDWR => "O_RDWR",
        _ => "O_RDONLY",
    });
    for (name, bit) in NAMED_BITS {
        if bit != &0 && flags & bit != 0 {
            parts.push(name);
        }
    }
    parts.join("|")
}

pub fn is_rdonly(flags: c_int) -> bool {
    flags & O_ACCMODE == O_RDONLY
}

pub fn is_wronly(flags: c_int) -> bool {
    flags & O_ACCMODE == O_WRONLY
}

pub fn is_rdwr(flags: c_int) -> bool {
    flags & O_ACCMODE == O_RDWR
}

pub fn is_write(flags: c_int) -> bool {
    is_wronly(flags) || is_rdwr(flags)
}

pub fn has_creat(flags: c_int) -> bool {
    flags & libc::O_CREAT != 0
}

pub fn is_trunc(flags: c_int) -> bool {
    flags & libc::O_TRUNC != 0
}

pub fn is_directory(flags: c_int) -> bool {
    flags & libc::O_DIRECTORY != 0
}
