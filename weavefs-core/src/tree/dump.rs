//! Textual dump of a virtual tree.
//!
//! One line per node in depth-first, folded-name order:
//!
//! ```text
//! /
//! /mnt/ -> ./lib [RECURSIVE]
//! /mnt/a.txt -> ./lib/a.txt [RECURSIVE]
//! /overlay/ (virtual) [NONE] create: /tmp/out
//! ```
//!
//! The renderer writes into any [`fmt::Write`], so the required size can be
//! measured without building the text and then written straight into a
//! caller's buffer.

use std::fmt::{self, Write};

use super::{NodeKind, VirtualNode, VirtualTree};

/// Writes the dump of `tree` into `out`.
pub fn write_dump<W: Write>(tree: &VirtualTree, out: &mut W) -> fmt::Result {
    let root = tree.root();
    out.write_char('/')?;
    if let Some(target) = root.create_target() {
        write!(out, " create: {}", target.display())?;
    }
    out.write_char('\n')?;

    let mut prefix = String::new();
    for child in root.children() {
        write_node(child, &mut prefix, out)?;
    }
    Ok(())
}

fn write_node<W: Write>(node: &VirtualNode, prefix: &mut String, out: &mut W) -> fmt::Result {
    write!(out, "{}/{}", prefix, node.name())?;
    if node.kind() == NodeKind::Directory {
        out.write_char('/')?;
    }
    match node.link_target() {
        Some(target) => write!(out, " -> {}", target.display())?,
        None => out.write_str(" (virtual)")?,
    }
    write!(out, " [{}]", node.flags())?;
    if let Some(target) = node.create_target() {
        write!(out, " create: {}", target.display())?;
    }
    out.write_char('\n')?;

    let restore = prefix.len();
    prefix.push('/');
    prefix.push_str(node.name());
    for child in node.children() {
        write_node(child, prefix, out)?;
    }
    prefix.truncate(restore);
    Ok(())
}

/// Renders the dump into a new string.
pub fn render(tree: &VirtualTree) -> String {
    let mut text = String::new();
    // Writing into a String never fails.
    let _ = write_dump(tree, &mut text);
    text
}

/// Number of bytes the dump of `tree` occupies.
pub fn measure(tree: &VirtualTree) -> usize {
    let mut counter = CountingWriter::default();
    let _ = write_dump(tree, &mut counter);
    counter.len
}

/// Writes the dump into `buffer`.
///
/// # Returns
/// `Ok(written)` when the buffer was large enough, `Err(required)` otherwise;
/// the buffer is left untouched in the error case
pub fn write_into(tree: &VirtualTree, buffer: &mut [u8]) -> Result<usize, usize> {
    let required = measure(tree);
    if required > buffer.len() {
        return Err(required);
    }
    let mut writer = SliceWriter { buffer, position: 0 };
    write_dump(tree, &mut writer).map_err(|_| required)?;
    Ok(writer.position)
}

#[derive(Default)]
struct CountingWriter {
    len: usize,
}

impl Write for CountingWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.len += s.len();
        Ok(())
    }
}

struct SliceWriter<'a> {
    buffer: &'a mut [u8],
    position: usize,
}

impl Write for SliceWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let end = self.position + s.len();
        if end > self.buffer.len() {
            return Err(fmt::Error);
        }
        self.buffer[self.position..end].copy_from_slice(s.as_bytes());
        self.position = end;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LinkFlags, VirtualPath};
    use std::path::PathBuf;

    fn sample_tree() -> VirtualTree {
        let mut tree = VirtualTree::new();
        let mnt = VirtualPath::parse("/mnt").unwrap();
        tree.link(&mnt, NodeKind::Directory, Some(PathBuf::from("lib")), LinkFlags::RECURSIVE)
            .unwrap();
        tree.link(
            &VirtualPath::parse("/mnt/b.txt").unwrap(),
            NodeKind::File,
            Some(PathBuf::from("lib/b.txt")),
            LinkFlags::RECURSIVE,
        )
        .unwrap();
        tree.link(
            &VirtualPath::parse("/mnt/A.txt").unwrap(),
            NodeKind::File,
            Some(PathBuf::from("lib/A.txt")),
            LinkFlags::RECURSIVE,
        )
        .unwrap();
        tree.set_create_target(&mnt, PathBuf::from("out")).unwrap();
        tree
    }

    #[test]
    fn test_render_format() {
        let text = render(&sample_tree());
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "/");
        assert_eq!(lines[1], "/mnt/ -> lib [RECURSIVE] create: out");
        assert_eq!(lines[2], "/mnt/A.txt -> lib/A.txt [RECURSIVE]");
        assert_eq!(lines[3], "/mnt/b.txt -> lib/b.txt [RECURSIVE]");
        assert_eq!(lines.len(), 4);
    }

    #[test]
    fn test_render_is_deterministic() {
        assert_eq!(render(&sample_tree()), render(&sample_tree()));
    }

    #[test]
    fn test_empty_tree() {
        assert_eq!(render(&VirtualTree::new()), "/\n");
        assert_eq!(measure(&VirtualTree::new()), 2);
    }

    #[test]
    fn test_virtual_directory_line() {
        let mut tree = VirtualTree::new();
        tree.ensure_virtual_directory(&VirtualPath::parse("/v").unwrap())
            .unwrap();
        assert_eq!(render(&tree), "/\n/v/ (virtual) [NONE]\n");
    }

    #[test]
    fn test_size_query_then_fill() {
        let tree = sample_tree();
        let required = measure(&tree);
        assert_eq!(required, render(&tree).len());

        let mut small = vec![0u8; required - 1];
        assert_eq!(write_into(&tree, &mut small), Err(required));
        assert!(small.iter().all(|byte| *byte == 0));

        let mut exact = vec![0u8; required];
        assert_eq!(write_into(&tree, &mut exact), Ok(required));
        assert_eq!(String::from_utf8(exact).unwrap(), render(&tree));
    }
}
