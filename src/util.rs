//! Small collection and path helpers shared by the compiler
//!
//! - [`DynArray`]: growable sequence with explicit power-of-two growth
//! - [`split_path`]: expands `:`-separated search path templates
//! - [`basename`], [`file_extension`], [`default_target`]: file name helpers

use std::ops::Index;
use std::path::Path;

/// Placeholder in path templates that stands for the compiler's library root.
pub const LIB_PATH_TOKEN: &str = "{B}";

/// Separator between entries of a search path list.
pub const PATH_SEPARATOR: char = ':';

/// Growable sequence that doubles its capacity every time the element count
/// reaches a power of two.
///
/// Ownership of the elements follows `T`: a `DynArray<String>` owns its
/// strings and frees them on [`DynArray::reset`], a `DynArray<&str>` only
/// borrows them.
#[derive(Debug, Clone)]
pub struct DynArray<T> {
    items: Vec<T>,
}

impl<T> Default for DynArray<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> DynArray<T> {
    pub fn new() -> Self {
        DynArray { items: Vec::new() }
    }

    /// Append an element, growing the backing storage to the next power of
    /// two when the current count is itself a power of two (or zero).
    pub fn push(&mut self, item: T) {
        let nb = self.items.len();
        if nb & nb.wrapping_sub(1) == 0 {
            let nb_alloc = if nb == 0 { 1 } else { nb * 2 };
            self.items.reserve_exact(nb_alloc - nb);
        }
        self.items.push(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.items.capacity()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.items
    }

    pub fn contains(&self, item: &T) -> bool
    where
        T: PartialEq,
    {
        self.items.contains(item)
    }

    /// Drop every element and release the backing storage.
    pub fn reset(&mut self) {
        self.items = Vec::new();
    }
}

impl<T> Index<usize> for DynArray<T> {
    type Output = T;

    fn index(&self, index: usize) -> &T {
        &self.items[index]
    }
}

impl<'a, T> IntoIterator for &'a DynArray<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

/// Split a `:`-separated path list, replacing `{B}` with `lib_path`, and
/// append every entry to `out`.
pub fn split_path(lib_path: &str, input: &str, out: &mut DynArray<String>) {
    for part in input.split(PATH_SEPARATOR) {
        out.push(part.replace(LIB_PATH_TOKEN, lib_path));
    }
}

/// Final component of a path (`"dir/file.c"` → `"file.c"`).
pub fn basename(name: &str) -> &str {
    match name.rfind('/') {
        Some(pos) => &name[pos + 1..],
        None => name,
    }
}

/// Extension of the final path component without the dot, or `""`.
pub fn file_extension(name: &str) -> &str {
    let base = basename(name);
    match base.rfind('.') {
        Some(pos) if pos > 0 => &base[pos + 1..],
        _ => "",
    }
}

/// Output name used when none is given: `dir/foo.c` becomes `foo.o` for
/// object and preprocessor output, everything else becomes `a.out`.
pub fn default_target(default_file: Option<&str>, object_like: bool) -> String {
    let name = match default_file {
        Some(file) if file != "-" => basename(file),
        _ => "a",
    };
    let ext = file_extension(name);
    if object_like && !ext.is_empty() {
        let stem = &name[..name.len() - ext.len() - 1];
        format!("{}.o", stem)
    } else {
        "a.out".to_string()
    }
}

/// Directory part of `filename`, used as the first search location for
/// quoted includes.
pub fn parent_dir(filename: &str) -> String {
    match Path::new(filename).parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_string_lossy().into_owned(),
        _ => ".".to_string(),
    }
}

/// Round `value` up to a multiple of `align` (a power of two, or 0/1).
pub fn align_up(value: u64, align: u64) -> u64 {
    if align <= 1 {
        value
    } else {
        (value + align - 1) & !(align - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dynarray_doubles_capacity() {
        let mut arr = DynArray::new();
        assert_eq!(arr.capacity(), 0);
        arr.push(1);
        assert!(arr.capacity() >= 1);
        arr.push(2);
        assert!(arr.capacity() >= 2);
        arr.push(3);
        assert!(arr.capacity() >= 4);
        assert_eq!(arr.len(), 3);
        assert_eq!(arr[2], 3);

        arr.reset();
        assert!(arr.is_empty());
        assert_eq!(arr.capacity(), 0);
    }

    #[test]
    fn test_split_path_substitutes_lib_root() {
        let mut out = DynArray::new();
        split_path("/opt/cc", "{B}/include:/usr/include", &mut out);
        assert_eq!(out.as_slice(), &["/opt/cc/include", "/usr/include"]);
    }

    #[test]
    fn test_file_name_helpers() {
        assert_eq!(basename("a/b/c.c"), "c.c");
        assert_eq!(file_extension("a/b/c.c"), "c");
        assert_eq!(file_extension("a.dir/file"), "");
        assert_eq!(default_target(Some("src/foo.c"), true), "foo.o");
        assert_eq!(default_target(Some("src/foo.c"), false), "a.out");
        assert_eq!(align_up(13, 8), 16);
        assert_eq!(align_up(16, 8), 16);
    }
}
