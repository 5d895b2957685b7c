//! POSIX-style open modes.

use volfs_error::{FsError, Result};

/// Flag set decoded from a mode string.
///
/// | mode | read | write | truncate | append | create |
/// |------|------|-------|----------|--------|--------|
/// | `r`  | ✓    |       |          |        |        |
/// | `w`  |      | ✓     | ✓        |        | ✓      |
/// | `a`  |      | ✓     |          | ✓      | ✓      |
/// | `r+` | ✓    | ✓     |          |        |        |
/// | `w+` | ✓    | ✓     | ✓        |        | ✓      |
/// | `a+` | ✓    | ✓     |          | ✓      | ✓      |
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenMode {
    pub read: bool,
    pub write: bool,
    pub append: bool,
    pub truncate: bool,
    pub create_if_not_exists: bool,
}

impl OpenMode {
    /// Decode a mode string; anything outside the six recognised modes is
    /// an error.
    pub fn parse(mode: &str) -> Result<Self> {
        let parsed = match mode {
            "r" => Self {
                read: true,
                ..Self::default()
            },
            "w" => Self {
                write: true,
                truncate: true,
                create_if_not_exists: true,
                ..Self::default()
            },
            "a" => Self {
                write: true,
                append: true,
                create_if_not_exists: true,
                ..Self::default()
            },
            "r+" => Self {
                read: true,
                write: true,
                ..Self::default()
            },
            "w+" => Self {
                read: true,
                write: true,
                truncate: true,
                create_if_not_exists: true,
                ..Self::default()
            },
            "a+" => Self {
                read: true,
                write: true,
                append: true,
                create_if_not_exists: true,
                ..Self::default()
            },
            other => return Err(FsError::InvalidMode(other.to_owned())),
        };
        Ok(parsed)
    }

    /// Whether a handle opened with this mode may write.
    #[must_use]
    pub fn writable(self) -> bool {
        self.write || self.append
    }
}

/// Seek origin. The discriminants are the wire constants of the external
/// interface: `SET = 0`, `CUR = 1`, `END = 2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Whence {
    Set = 0,
    Cur = 1,
    End = 2,
}

impl Whence {
    /// Decode the numeric constant.
    #[must_use]
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Set),
            1 => Some(Self::Cur),
            2 => Some(Self::End),
            _ => None,
        }
    }
}
