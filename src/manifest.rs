//! The bmap manifest and its XML text form.
//!
//! Output is built as a string so that the bytes depend only on the manifest
//! contents: fixed element order, 4-space indentation, lowercase hex and `\n`
//! line endings. Input is read with an event parser and validated before a
//! [`Manifest`] is returned.
//!
//! The document carries its own checksum in `<BmapFileChecksum>`. It is the
//! digest, with the manifest's checksum type, of the document in which that
//! value has been replaced by the same number of `0` characters.

use std::io::{Read, Write};

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::config::validate_block_size;
use crate::error::{BmapError, Result};
use crate::hash::{ChecksumType, Digest};
use crate::range::{blocks_for, BlockRange, ExtentSet, Holes};

/// Format version written to the `version` attribute of the root element.
pub const FORMAT_VERSION: &str = "1.0";

const SELF_CHECKSUM_OPEN: &str = "<BmapFileChecksum>";
const SELF_CHECKSUM_CLOSE: &str = "</BmapFileChecksum>";

/// A mapped block range together with the checksum of its bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedRange {
    /// Blocks covered.
    pub range: BlockRange,
    /// Digest of the range's bytes, last block clipped to the image size.
    pub checksum: Digest,
}

/// Parsed or generated block map of one image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    image_size: u64,
    block_size: u64,
    blocks_count: u64,
    mapped_blocks_count: u64,
    checksum_type: ChecksumType,
    ranges: Vec<MappedRange>,
    image_checksum: Digest,
}

impl Manifest {
    /// Assemble a manifest, checking its internal consistency.
    ///
    /// # Errors
    ///
    /// Returns `ManifestFormat` if the block size is invalid, the image size
    /// is too large to address, ranges are out of order, overlap or exceed
    /// the image, or a digest has the wrong length for `checksum_type`.
    pub fn new(
        image_size: u64,
        block_size: u64,
        checksum_type: ChecksumType,
        ranges: Vec<MappedRange>,
        image_checksum: Digest,
    ) -> Result<Self> {
        validate_block_size(block_size).map_err(|e| BmapError::ManifestFormat(e.to_string()))?;
        // Byte offsets of every block, the last partial one included, must fit in u64
        if image_size > u64::MAX - block_size {
            return Err(format_error(format!("image size {image_size} is too large")));
        }

        let blocks_count = blocks_for(image_size, block_size);
        let digest_len = checksum_type.digest_len();

        let mut prev_end = 0;
        for (i, mapped) in ranges.iter().enumerate() {
            let range = mapped.range;
            if range.is_empty() {
                return Err(format_error(format!("empty range {}..{}", range.start, range.end)));
            }
            if i > 0 && range.start < prev_end {
                return Err(format_error(format!(
                    "range {range} overlaps or precedes the previous range"
                )));
            }
            if range.end > blocks_count {
                return Err(format_error(format!(
                    "range {range} exceeds block count {blocks_count}"
                )));
            }
            if mapped.checksum.len() != digest_len {
                return Err(format_error(format!(
                    "checksum of range {range} is {} bytes, {checksum_type} needs {digest_len}",
                    mapped.checksum.len()
                )));
            }
            prev_end = range.end;
        }

        if image_checksum.len() != digest_len {
            return Err(format_error(format!(
                "image checksum is {} bytes, {checksum_type} needs {digest_len}",
                image_checksum.len()
            )));
        }

        let mapped_blocks_count = ranges.iter().map(|m| m.range.len()).sum();

        Ok(Self {
            image_size,
            block_size,
            blocks_count,
            mapped_blocks_count,
            checksum_type,
            ranges,
            image_checksum,
        })
    }

    /// Image size in bytes.
    #[must_use]
    pub const fn image_size(&self) -> u64 {
        self.image_size
    }

    /// Block size in bytes.
    #[must_use]
    pub const fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Total number of blocks, last partial block included.
    #[must_use]
    pub const fn blocks_count(&self) -> u64 {
        self.blocks_count
    }

    /// Number of mapped blocks.
    #[must_use]
    pub const fn mapped_blocks_count(&self) -> u64 {
        self.mapped_blocks_count
    }

    /// Checksum algorithm of every digest in the manifest.
    #[must_use]
    pub const fn checksum_type(&self) -> ChecksumType {
        self.checksum_type
    }

    /// Mapped ranges in ascending order.
    #[must_use]
    pub fn ranges(&self) -> &[MappedRange] {
        &self.ranges
    }

    /// Aggregate digest over the bytes of all mapped ranges, in order.
    #[must_use]
    pub const fn image_checksum(&self) -> &Digest {
        &self.image_checksum
    }

    /// Number of image bytes inside mapped ranges.
    #[must_use]
    pub fn mapped_bytes(&self) -> u64 {
        self.ranges
            .iter()
            .map(|m| m.range.byte_len(self.block_size, self.image_size))
            .sum()
    }

    /// Unmapped ranges of the image.
    pub fn holes(&self) -> impl Iterator<Item = BlockRange> + '_ {
        Holes::new(self.ranges.iter().map(|m| m.range), 0, self.blocks_count)
    }

    /// Mapped ranges as a normalized set.
    #[must_use]
    pub fn extent_set(&self) -> ExtentSet {
        ExtentSet::from_ranges(self.blocks_count, self.ranges.iter().map(|m| m.range))
    }

    /// Serialize to the XML text form.
    ///
    /// The output is identical for equal manifests.
    #[must_use]
    pub fn to_xml(&self) -> String {
        let zeros = "0".repeat(self.checksum_type.digest_len() * 2);
        let draft = self.render(&zeros);
        let self_checksum = self.checksum_type.digest(draft.as_bytes());
        self.render(&self_checksum.to_string())
    }

    /// Write the XML text form to `writer`.
    ///
    /// # Errors
    ///
    /// Returns `DestinationUnwritable` if writing fails.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer
            .write_all(self.to_xml().as_bytes())
            .and_then(|()| writer.flush())
            .map_err(BmapError::DestinationUnwritable)
    }

    /// Read and parse a manifest from `reader`.
    ///
    /// # Errors
    ///
    /// Returns `SourceUnreadable` if reading fails and `ManifestFormat` if
    /// the text is not a valid manifest.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut bytes = Vec::new();
        reader
            .read_to_end(&mut bytes)
            .map_err(|e| BmapError::unreadable("manifest", e))?;
        let text = String::from_utf8(bytes)
            .map_err(|e| format_error(format!("manifest is not UTF-8: {e}")))?;
        Self::parse(&text)
    }

    /// Parse the XML text form.
    ///
    /// # Errors
    ///
    /// Returns `ManifestFormat` on malformed XML, missing or duplicate
    /// fields, inconsistent counts, or a self-checksum mismatch.
    ///
    /// # Example
    ///
    /// ```rust
    /// use bmapcopy::{ChecksumType, Manifest};
    ///
    /// let empty = ChecksumType::Sha256.digest(b"");
    /// let manifest = Manifest::new(0, 4096, ChecksumType::Sha256, Vec::new(), empty)?;
    /// let parsed = Manifest::parse(&manifest.to_xml())?;
    /// assert_eq!(parsed, manifest);
    /// # Ok::<(), bmapcopy::BmapError>(())
    /// ```
    pub fn parse(xml: &str) -> Result<Self> {
        let fields = Fields::read(xml)?;
        let checksum_type = fields.checksum_type()?;
        let self_checksum = fields.self_checksum(checksum_type)?;

        let manifest = Self::new(
            fields.image_size()?,
            fields.block_size()?,
            checksum_type,
            fields.ranges,
            fields
                .image_checksum
                .ok_or_else(|| missing("ImageChecksum"))?,
        )?;

        if manifest.blocks_count != fields.blocks_count.ok_or_else(|| missing("BlocksCount"))? {
            return Err(format_error(format!(
                "BlocksCount does not match ImageSize / BlockSize ({})",
                manifest.blocks_count
            )));
        }
        let mapped = fields
            .mapped_blocks_count
            .ok_or_else(|| missing("MappedBlocksCount"))?;
        if manifest.mapped_blocks_count != mapped {
            return Err(format_error(format!(
                "MappedBlocksCount is {mapped}, ranges cover {}",
                manifest.mapped_blocks_count
            )));
        }

        let actual = checksum_type.digest(zero_self_checksum(xml)?.as_bytes());
        if !actual.ct_eq(&self_checksum) {
            return Err(format_error(format!(
                "manifest checksum mismatch: expected {self_checksum}, got {actual}"
            )));
        }

        Ok(manifest)
    }

    fn render(&self, self_checksum: &str) -> String {
        let mut xml = String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
        xml.push_str(&format!("<bmap version=\"{FORMAT_VERSION}\">\n"));
        xml.push_str(&format!("    <ImageSize>{}</ImageSize>\n", self.image_size));
        xml.push_str(&format!("    <BlockSize>{}</BlockSize>\n", self.block_size));
        xml.push_str(&format!("    <BlocksCount>{}</BlocksCount>\n", self.blocks_count));
        xml.push_str(&format!(
            "    <MappedBlocksCount>{}</MappedBlocksCount>\n",
            self.mapped_blocks_count
        ));
        xml.push_str(&format!(
            "    <ChecksumType>{}</ChecksumType>\n",
            self.checksum_type
        ));
        xml.push_str(&format!(
            "    {SELF_CHECKSUM_OPEN}{self_checksum}{SELF_CHECKSUM_CLOSE}\n"
        ));

        xml.push_str("    <BlockMap>\n");
        for mapped in &self.ranges {
            xml.push_str(&format!(
                "        <Range chksum=\"{}\">{}</Range>\n",
                mapped.checksum, mapped.range
            ));
        }
        xml.push_str("    </BlockMap>\n");

        xml.push_str(&format!(
            "    <ImageChecksum>{}</ImageChecksum>\n",
            self.image_checksum
        ));
        xml.push_str("</bmap>\n");
        xml
    }
}

fn format_error(msg: impl Into<String>) -> BmapError {
    BmapError::ManifestFormat(msg.into())
}

fn missing(field: &str) -> BmapError {
    format_error(format!("missing <{field}>"))
}

/// Replace the self-checksum value with `0` characters of the same length.
fn zero_self_checksum(xml: &str) -> Result<String> {
    let start = xml
        .find(SELF_CHECKSUM_OPEN)
        .ok_or_else(|| missing("BmapFileChecksum"))?
        + SELF_CHECKSUM_OPEN.len();
    let len = xml[start..]
        .find(SELF_CHECKSUM_CLOSE)
        .ok_or_else(|| missing("BmapFileChecksum"))?;

    let mut zeroed = String::with_capacity(xml.len());
    zeroed.push_str(&xml[..start]);
    zeroed.extend(std::iter::repeat('0').take(len));
    zeroed.push_str(&xml[start + len..]);
    Ok(zeroed)
}

/// Parse range text: `first-last` (inclusive) or a single block number.
fn parse_range(text: &str) -> Result<BlockRange> {
    let bad = || format_error(format!("invalid range {text:?}"));
    let number = |s: &str| s.trim().parse::<u64>().map_err(|_| bad());

    let (first, last) = match text.split_once('-') {
        Some((first, last)) => (number(first)?, number(last)?),
        None => {
            let n = number(text)?;
            (n, n)
        }
    };
    if first > last {
        return Err(bad());
    }
    let end = last.checked_add(1).ok_or_else(bad)?;
    Ok(BlockRange { start: first, end })
}

fn parse_number(field: &str, text: &str) -> Result<u64> {
    text.trim()
        .parse()
        .map_err(|_| format_error(format!("<{field}> is not a number: {text:?}")))
}

fn element_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.name().as_ref()).to_string()
}

/// Raw field values collected from the document, before validation.
#[derive(Default)]
struct Fields {
    version: Option<String>,
    image_size: Option<u64>,
    block_size: Option<u64>,
    blocks_count: Option<u64>,
    mapped_blocks_count: Option<u64>,
    checksum_type: Option<String>,
    self_checksum: Option<String>,
    ranges: Vec<MappedRange>,
    range_checksum: Option<String>,
    image_checksum: Option<Digest>,
    seen_block_map: bool,
}

impl Fields {
    fn read(xml: &str) -> Result<Self> {
        let mut reader = Reader::from_str(xml);
        reader.trim_text(true);

        let mut fields = Self::default();
        let mut buf = Vec::new();
        let mut path: Vec<String> = Vec::new();
        let mut text = String::new();

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(e)) => {
                    let name = element_name(&e);
                    fields.open(&path, &name, &e)?;
                    path.push(name);
                    text.clear();
                }
                Ok(Event::Empty(e)) => {
                    let name = element_name(&e);
                    fields.open(&path, &name, &e)?;
                    path.push(name);
                    fields.close(&path, "")?;
                    path.pop();
                }
                Ok(Event::Text(e)) => {
                    let unescaped = e
                        .unescape()
                        .map_err(|e| format_error(format!("bad text: {e}")))?;
                    text.push_str(&unescaped);
                }
                Ok(Event::End(_)) => {
                    fields.close(&path, &text)?;
                    path.pop();
                    text.clear();
                }
                Ok(Event::Eof) => break,
                Err(e) => {
                    return Err(format_error(format!(
                        "XML error at byte {}: {e}",
                        reader.buffer_position()
                    )))
                }
                _ => {}
            }
            buf.clear();
        }

        if fields.version.is_none() {
            return Err(missing("bmap"));
        }
        if !fields.seen_block_map {
            return Err(missing("BlockMap"));
        }
        Ok(fields)
    }

    fn open(&mut self, path: &[String], name: &str, e: &BytesStart<'_>) -> Result<()> {
        let parents: Vec<&str> = path.iter().map(String::as_str).collect();
        match (parents.as_slice(), name) {
            ([], "bmap") => {
                let version = attribute(e, "version")?.ok_or_else(|| {
                    format_error("missing version attribute on <bmap>")
                })?;
                if version.split('.').next() != FORMAT_VERSION.split('.').next() {
                    return Err(format_error(format!(
                        "unsupported manifest version {version}"
                    )));
                }
                self.version = Some(version);
            }
            ([], other) => {
                return Err(format_error(format!(
                    "unexpected root element <{other}>"
                )))
            }
            (["bmap"], "BlockMap") => {
                if self.seen_block_map {
                    return Err(format_error("duplicate <BlockMap>"));
                }
                self.seen_block_map = true;
            }
            (["bmap", "BlockMap"], "Range") => {
                let checksum = attribute(e, "chksum")?
                    .ok_or_else(|| format_error("<Range> without chksum attribute"))?;
                self.range_checksum = Some(checksum);
            }
            _ => {}
        }
        Ok(())
    }

    fn close(&mut self, path: &[String], text: &str) -> Result<()> {
        let path: Vec<&str> = path.iter().map(String::as_str).collect();
        match path.as_slice() {
            ["bmap", "ImageSize"] => set_once(&mut self.image_size, "ImageSize", || {
                parse_number("ImageSize", text)
            }),
            ["bmap", "BlockSize"] => set_once(&mut self.block_size, "BlockSize", || {
                parse_number("BlockSize", text)
            }),
            ["bmap", "BlocksCount"] => set_once(&mut self.blocks_count, "BlocksCount", || {
                parse_number("BlocksCount", text)
            }),
            ["bmap", "MappedBlocksCount"] => {
                set_once(&mut self.mapped_blocks_count, "MappedBlocksCount", || {
                    parse_number("MappedBlocksCount", text)
                })
            }
            ["bmap", "ChecksumType"] => set_once(&mut self.checksum_type, "ChecksumType", || {
                Ok(text.trim().to_string())
            }),
            ["bmap", "BmapFileChecksum"] => {
                set_once(&mut self.self_checksum, "BmapFileChecksum", || {
                    Ok(text.trim().to_string())
                })
            }
            ["bmap", "ImageChecksum"] => set_once(&mut self.image_checksum, "ImageChecksum", || {
                Digest::from_hex(text)
            }),
            ["bmap", "BlockMap", "Range"] => {
                let checksum = self
                    .range_checksum
                    .take()
                    .ok_or_else(|| format_error("<Range> without chksum attribute"))?;
                self.ranges.push(MappedRange {
                    range: parse_range(text)?,
                    checksum: Digest::from_hex(&checksum)?,
                });
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn checksum_type(&self) -> Result<ChecksumType> {
        self.checksum_type
            .as_deref()
            .ok_or_else(|| missing("ChecksumType"))?
            .parse()
    }

    fn self_checksum(&self, checksum_type: ChecksumType) -> Result<Digest> {
        let hex = self
            .self_checksum
            .as_deref()
            .ok_or_else(|| missing("BmapFileChecksum"))?;
        let digest = Digest::from_hex(hex)?;
        if digest.len() != checksum_type.digest_len() {
            return Err(format_error(format!(
                "BmapFileChecksum has the wrong length for {checksum_type}"
            )));
        }
        Ok(digest)
    }

    fn image_size(&self) -> Result<u64> {
        self.image_size.ok_or_else(|| missing("ImageSize"))
    }

    fn block_size(&self) -> Result<u64> {
        self.block_size.ok_or_else(|| missing("BlockSize"))
    }
}

fn set_once<T>(slot: &mut Option<T>, field: &str, value: impl FnOnce() -> Result<T>) -> Result<()> {
    if slot.is_some() {
        return Err(format_error(format!("duplicate <{field}>")));
    }
    *slot = Some(value()?);
    Ok(())
}

fn attribute(e: &BytesStart<'_>, key: &str) -> Result<Option<String>> {
    for attr in e.attributes() {
        let attr = attr.map_err(|e| format_error(format!("bad attribute: {e}")))?;
        if attr.key.as_ref() == key.as_bytes() {
            let value = attr
                .unescape_value()
                .map_err(|e| format_error(format!("bad attribute value: {e}")))?;
            return Ok(Some(value.to_string()));
        }
    }
    Ok(None)
}
