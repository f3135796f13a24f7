//! Per-input Huffman coding of byte streams.
//!
//! Compressed layout:
//!
//! ```text
//! [original byte count: u64 LE][symbol count: u32 LE]
//! symbol count x [byte][codeword as ASCII '0'/'1'...]['$']
//! [payload: codewords packed MSB first, last byte zero padded]
//! ```
//!
//! The tree is deterministic for a given input: leaves enter the heap in ascending byte order,
//! the heap pops the lowest count first and breaks ties by the lower arena index, and the first
//! node popped becomes the left (`0`) child. An input with a single distinct byte gets the
//! one-bit codeword `0`.

use crate::{Error, Result};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use tracing::debug;

const SENTINEL: u8 = b'$';
const CHUNK_SIZE: usize = 8 * 1024;
const SYMBOLS: usize = 256;

type Frequencies = [u64; SYMBOLS];
type Codewords = Vec<Option<Vec<bool>>>;

#[derive(Debug, Clone, Copy)]
struct Node {
    byte: u8,
    count: u64,
    left: Option<usize>,
    right: Option<usize>,
}

impl Node {
    fn leaf(byte: u8, count: u64) -> Self {
        Self { byte, count, left: None, right: None }
    }

    fn is_leaf(&self) -> bool {
        self.left.is_none() && self.right.is_none()
    }
}

struct Tree {
    nodes: Vec<Node>,
    root: Option<usize>,
}

impl Tree {
    fn build(frequencies: &Frequencies) -> Self {
        let mut nodes = Vec::with_capacity(2 * SYMBOLS);
        let mut heap = BinaryHeap::new();

        for (byte, &count) in frequencies.iter().enumerate() {
            if count > 0 {
                heap.push(Reverse((count, nodes.len())));
                nodes.push(Node::leaf(byte as u8, count));
            }
        }

        while heap.len() > 1 {
            let (Some(Reverse((_, left))), Some(Reverse((_, right)))) = (heap.pop(), heap.pop())
            else {
                break;
            };
            let count = nodes[left].count + nodes[right].count;
            heap.push(Reverse((count, nodes.len())));
            nodes.push(Node { byte: 0, count, left: Some(left), right: Some(right) });
        }

        let root = heap.pop().map(|Reverse((_, index))| index);
        Self { nodes, root }
    }

    fn codewords(&self) -> Codewords {
        let mut codewords: Codewords = vec![None; SYMBOLS];
        let Some(root) = self.root else {
            return codewords;
        };

        if self.nodes[root].is_leaf() {
            codewords[self.nodes[root].byte as usize] = Some(vec![false]);
            return codewords;
        }

        let mut stack = vec![(root, Vec::new())];
        while let Some((index, bits)) = stack.pop() {
            let node = &self.nodes[index];
            if node.is_leaf() {
                codewords[node.byte as usize] = Some(bits);
                continue;
            }
            if let Some(right) = node.right {
                let mut path = bits.clone();
                path.push(true);
                stack.push((right, path));
            }
            if let Some(left) = node.left {
                let mut path = bits;
                path.push(false);
                stack.push((left, path));
            }
        }
        codewords
    }
}

/// Codeword lookup used while decoding: a binary trie rebuilt from the header table.
struct DecodeTrie {
    children: Vec<[Option<usize>; 2]>,
    symbols: Vec<Option<u8>>,
}

impl DecodeTrie {
    const ROOT: usize = 0;

    fn new() -> Self {
        Self { children: vec![[None, None]], symbols: vec![None] }
    }

    fn insert(&mut self, code: &[u8], byte: u8) -> Result<()> {
        if code.is_empty() {
            return Err(Error::Format(format!("empty codeword for byte {:#04x}", byte)));
        }

        let mut node = Self::ROOT;
        for &c in code {
            if self.symbols[node].is_some() {
                return Err(Error::Format("codeword table is not prefix free".to_string()));
            }
            let bit = match c {
                b'0' => 0,
                b'1' => 1,
                other => {
                    return Err(Error::Format(format!("invalid codeword character {:#04x}", other)));
                }
            };
            node = match self.children[node][bit] {
                Some(next) => next,
                None => {
                    let next = self.children.len();
                    self.children.push([None, None]);
                    self.symbols.push(None);
                    self.children[node][bit] = Some(next);
                    next
                }
            };
        }

        if self.symbols[node].is_some() || self.children[node] != [None, None] {
            return Err(Error::Format("codeword table is not prefix free".to_string()));
        }
        self.symbols[node] = Some(byte);
        Ok(())
    }

    fn step(&self, node: usize, bit: u8) -> Option<usize> {
        self.children[node][bit as usize]
    }

    fn symbol(&self, node: usize) -> Option<u8> {
        self.symbols[node]
    }
}

struct BitWriter<W: Write> {
    inner: W,
    current: u8,
    filled: u8,
}

impl<W: Write> BitWriter<W> {
    fn new(inner: W) -> Self {
        Self { inner, current: 0, filled: 0 }
    }

    fn write_bits(&mut self, bits: &[bool]) -> io::Result<()> {
        for &bit in bits {
            self.current = (self.current << 1) | bit as u8;
            self.filled += 1;
            if self.filled == 8 {
                self.inner.write_all(&[self.current])?;
                self.current = 0;
                self.filled = 0;
            }
        }
        Ok(())
    }

    /// Pads the last partial byte with zero bits.
    fn finish(mut self) -> io::Result<W> {
        if self.filled > 0 {
            let byte = self.current << (8 - self.filled);
            self.inner.write_all(&[byte])?;
        }
        self.inner.flush()?;
        Ok(self.inner)
    }
}

fn read_chunk<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        match reader.read(buf) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

fn frequencies<R: Read>(input: &mut R) -> io::Result<(Frequencies, u64)> {
    let mut table = [0u64; SYMBOLS];
    let mut total = 0u64;
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = read_chunk(input, &mut buf)?;
        if n == 0 {
            break;
        }
        for &byte in &buf[..n] {
            table[byte as usize] += 1;
        }
        total += n as u64;
    }
    Ok((table, total))
}

fn write_header<W: Write>(out: &mut W, total: u64, codewords: &Codewords) -> io::Result<()> {
    let symbols = codewords.iter().filter(|c| c.is_some()).count() as u32;
    out.write_all(&total.to_le_bytes())?;
    out.write_all(&symbols.to_le_bytes())?;

    for (byte, code) in codewords.iter().enumerate() {
        let Some(code) = code else { continue };
        out.write_all(&[byte as u8])?;
        let text: Vec<u8> = code.iter().map(|&bit| if bit { b'1' } else { b'0' }).collect();
        out.write_all(&text)?;
        out.write_all(&[SENTINEL])?;
    }
    Ok(())
}

fn read_exact_or_format<R: Read>(reader: &mut R, buf: &mut [u8], what: &str) -> Result<()> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => Error::Format(format!("failed to read the {}", what)),
        _ => Error::Io(e),
    })
}

fn read_table<R: Read>(reader: &mut R) -> Result<(u64, DecodeTrie)> {
    let mut word = [0u8; 8];
    read_exact_or_format(reader, &mut word, "original size")?;
    let total = u64::from_le_bytes(word);

    let mut word = [0u8; 4];
    read_exact_or_format(reader, &mut word, "symbol count")?;
    let symbols = u32::from_le_bytes(word) as usize;
    if symbols > SYMBOLS {
        return Err(Error::Format(format!("symbol count {} exceeds {}", symbols, SYMBOLS)));
    }

    let mut trie = DecodeTrie::new();
    for _ in 0..symbols {
        let mut byte = [0u8; 1];
        read_exact_or_format(reader, &mut byte, "symbol")?;

        let mut code = Vec::new();
        loop {
            let mut c = [0u8; 1];
            read_exact_or_format(reader, &mut c, "codeword")?;
            if c[0] == SENTINEL {
                break;
            }
            // A codeword can never be longer than the number of leaves.
            if code.len() >= SYMBOLS {
                return Err(Error::Format("codeword is too long".to_string()));
            }
            code.push(c[0]);
        }
        trie.insert(&code, byte[0])?;
    }

    if total > 0 && symbols == 0 {
        return Err(Error::Format("non-empty payload without a codeword table".to_string()));
    }
    Ok((total, trie))
}

/// Compresses `input` into `output`. The input is read twice, so it must be seekable.
pub fn compress<R, W>(input: &mut R, output: &mut W) -> Result<()>
where
    R: Read + Seek,
    W: Write,
{
    input.seek(SeekFrom::Start(0))?;
    let (table, total) = frequencies(input)?;

    let tree = Tree::build(&table);
    let codewords = tree.codewords();

    let mut out = BufWriter::new(output);
    write_header(&mut out, total, &codewords)?;

    input.seek(SeekFrom::Start(0))?;
    let mut bits = BitWriter::new(out);
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut encoded = 0u64;
    loop {
        let n = read_chunk(input, &mut buf)?;
        if n == 0 {
            break;
        }
        for &byte in &buf[..n] {
            let code = codewords[byte as usize].as_ref().ok_or_else(|| {
                Error::Format(format!("byte {:#04x} has no codeword", byte))
            })?;
            bits.write_bits(code)?;
        }
        encoded += n as u64;
    }

    if encoded != total {
        return Err(Error::Format(format!(
            "input changed while compressing ({} bytes counted, {} encoded)",
            total, encoded
        )));
    }

    bits.finish()?;
    debug!(bytes = total, symbols = codewords.iter().flatten().count(), "compressed");
    Ok(())
}

/// Reverses [`compress`].
pub fn uncompress<R, W>(input: &mut R, output: &mut W) -> Result<()>
where
    R: Read,
    W: Write,
{
    let mut reader = BufReader::new(input);
    let (total, trie) = read_table(&mut reader)?;

    let mut out = BufWriter::new(output);
    let mut remaining = total;
    let mut node = DecodeTrie::ROOT;
    let mut buf = vec![0u8; CHUNK_SIZE];

    'decode: while remaining > 0 {
        let n = read_chunk(&mut reader, &mut buf)?;
        if n == 0 {
            return Err(Error::Format(format!(
                "compressed stream ended with {} bytes still to decode",
                remaining
            )));
        }
        for &byte in &buf[..n] {
            for shift in (0..8).rev() {
                node = trie
                    .step(node, (byte >> shift) & 1)
                    .ok_or_else(|| Error::Format("bit sequence matches no codeword".to_string()))?;
                if let Some(symbol) = trie.symbol(node) {
                    out.write_all(&[symbol])?;
                    node = DecodeTrie::ROOT;
                    remaining -= 1;
                    if remaining == 0 {
                        break 'decode;
                    }
                }
            }
        }
    }

    out.flush()?;
    debug!(bytes = total, "uncompressed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn round_trip(data: &[u8]) -> Vec<u8> {
        let mut compressed = Vec::new();
        compress(&mut Cursor::new(data), &mut compressed).unwrap();

        let mut restored = Vec::new();
        uncompress(&mut Cursor::new(&compressed), &mut restored).unwrap();
        restored
    }

    #[test]
    fn test_compression_roundtrip() {
        let data = "heellllo".repeat(100).into_bytes();
        assert_eq!(round_trip(&data), data);
    }

    #[test]
    fn test_all_byte_values() {
        let data: Vec<u8> = (0..20_000u32).map(|i| ((i * i + 7 * i) % 256) as u8).collect();
        assert_eq!(round_trip(&data), data);
    }

    #[test]
    fn test_empty_input() {
        let mut compressed = Vec::new();
        compress(&mut Cursor::new(Vec::<u8>::new()), &mut compressed).unwrap();
        assert_eq!(compressed, [0u8; 12]);

        assert!(round_trip(&[]).is_empty());
    }

    #[test]
    fn test_single_symbol_uses_one_bit() {
        let data = vec![b'a'; 1000];
        let mut compressed = Vec::new();
        compress(&mut Cursor::new(&data), &mut compressed).unwrap();

        // 8 + 4 header bytes, "a0$", then 1000 bits.
        assert_eq!(compressed.len(), 12 + 3 + 125);
        assert_eq!(&compressed[12..15], b"a0$");
        assert!(compressed[15..].iter().all(|&b| b == 0));

        assert_eq!(round_trip(&data), data);
    }

    #[test]
    fn test_tie_break_is_deterministic() {
        let mut compressed = Vec::new();
        compress(&mut Cursor::new(b"ab"), &mut compressed).unwrap();

        let mut expected = Vec::new();
        expected.extend_from_slice(&2u64.to_le_bytes());
        expected.extend_from_slice(&2u32.to_le_bytes());
        expected.extend_from_slice(b"a0$b1$");
        expected.push(0b0100_0000);
        assert_eq!(compressed, expected);
    }

    #[test]
    fn test_repetitive_text_shrinks() {
        let data = "the quick brown fox ".repeat(500).into_bytes();
        let mut compressed = Vec::new();
        compress(&mut Cursor::new(&data), &mut compressed).unwrap();
        assert!(compressed.len() < data.len() / 2);
    }

    #[test]
    fn test_truncated_payload() {
        let data = "heellllo".repeat(100).into_bytes();
        let mut compressed = Vec::new();
        compress(&mut Cursor::new(&data), &mut compressed).unwrap();
        compressed.truncate(compressed.len() - 10);

        let err = uncompress(&mut Cursor::new(&compressed), &mut Vec::new()).unwrap_err();
        assert!(matches!(err, Error::Format(_)));
    }

    #[test]
    fn test_malformed_header() {
        let mut bad = Vec::new();
        bad.extend_from_slice(&5u64.to_le_bytes());
        bad.extend_from_slice(&300u32.to_le_bytes());
        let err = uncompress(&mut Cursor::new(&bad), &mut Vec::new()).unwrap_err();
        assert!(matches!(err, Error::Format(_)));

        let mut conflicting = Vec::new();
        conflicting.extend_from_slice(&1u64.to_le_bytes());
        conflicting.extend_from_slice(&2u32.to_le_bytes());
        conflicting.extend_from_slice(b"a0$b01$");
        let err = uncompress(&mut Cursor::new(&conflicting), &mut Vec::new()).unwrap_err();
        assert!(matches!(err, Error::Format(_)));

        let err = uncompress(&mut Cursor::new(&[1u8, 2, 3]), &mut Vec::new()).unwrap_err();
        assert!(matches!(err, Error::Format(_)));
    }
}
