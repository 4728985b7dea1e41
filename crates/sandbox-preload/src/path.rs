//! Lexical path flattening against the virtual working directory

use sandbox_protocol::PATH_CAPACITY;

/// Longest string [`FlatPath`] holds; one byte of the wire buffer is
/// reserved for the terminator.
pub const MAX_LEN: usize = PATH_CAPACITY - 1;

/// An absolute path with no empty, `.` or `..` components
#[derive(Clone, Copy)]
pub struct FlatPath {
    buf: [u8; MAX_LEN],
    len: usize,
}

impl FlatPath {
    pub const fn root() -> Self {
        let mut buf = [0; MAX_LEN];
        buf[0] = b'/';
        Self { buf, len: 1 }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_root(&self) -> bool {
        self.len == 1
    }

    pub fn trim_trailing_slash(&mut self) {
        if !self.is_root() && self.buf[self.len - 1] == b'/' {
            self.len -= 1;
        }
    }

    fn push(&mut self, byte: u8) -> Option<()> {
        let slot = self.buf.get_mut(self.len)?;
        *slot = byte;
        self.len += 1;
        Some(())
    }

    fn pop(&mut self) {
        if self.is_root() {
            return;
        }
        let cut = self.buf[..self.len]
            .iter()
            .rposition(|&b| b == b'/')
            .unwrap_or(0);
        self.len = cut.max(1);
    }

    fn push_components(&mut self, path: &[u8]) -> Option<()> {
        for component in path.split(|&b| b == b'/') {
            match component {
                b"" | b"." => {}
                b".." => self.pop(),
                name => {
                    if !self.is_root() {
                        self.push(b'/')?;
                    }
                    for &b in name {
                        self.push(b)?;
                    }
                }
            }
        }
        Some(())
    }
}

/// Resolve `path` against `cwd` purely by string manipulation.
///
/// `..` never climbs above `/`. A trailing `/` on `path` is kept so the
/// broker can tell a directory lookup apart. Returns `None` when the result
/// does not fit in a request.
pub fn flatten(cwd: &[u8], path: &[u8]) -> Option<FlatPath> {
    let mut out = FlatPath::root();
    if path.first() != Some(&b'/') {
        out.push_components(cwd)?;
    }
    out.push_components(path)?;
    if path.ends_with(b"/") && !out.is_root() {
        out.push(b'/')?;
    }
    Some(out)
}
