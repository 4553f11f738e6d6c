//! OME-XML bookkeeping.
//!
//! Planes are recorded as they are written, one `TiffData` element per IFD.
//! When the acquisition ends, holes in the last frame are declared with
//! zero-plane `TiffData` entries and `SizeT` is trimmed so downstream readers
//! see a consistent, rectangular dataset.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write;

use crate::image::PixelType;
use crate::metadata::SummaryInfo;

const OME_NAMESPACE: &str = "http://www.openmicroscopy.org/Schemas/OME/2016-06";
const XSI_NAMESPACE: &str = "http://www.w3.org/2001/XMLSchema-instance";
const SCHEMA_LOCATION: &str =
    "http://www.openmicroscopy.org/Schemas/OME/2016-06 http://www.openmicroscopy.org/Schemas/OME/2016-06/ome.xsd";

/// Smallest escaped name length the estimates assume.
const MIN_RESERVED_NAME_LEN: usize = 64;

/// One `TiffData` element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TiffDataEntry {
    pub ifd: u32,
    pub channel: u32,
    pub slice: u32,
    pub frame: u32,
    pub plane_count: u32,
    /// `(file name, urn:uuid)` of the file holding the plane
    pub file: Option<(String, String)>,
}

#[derive(Debug, Clone, Default)]
struct PositionPlanes {
    name: Option<String>,
    num_frames: Option<u32>,
    planes: Vec<TiffDataEntry>,
    seen: BTreeSet<(u32, u32, u32)>,
}

/// Per-position plane table for one acquisition.
#[derive(Debug, Clone)]
pub struct OmeMetadata {
    width: u32,
    height: u32,
    pixel_type: PixelType,
    channels: u32,
    slices: u32,
    frames: u32,
    slices_first: bool,
    pixel_size_um: Option<f64>,
    channel_names: Vec<String>,
    positions: BTreeMap<u32, PositionPlanes>,
    /// Longest escaped file and position names the estimates cover
    file_name_len: usize,
    position_name_len: usize,
    plane_len: usize,
    base_len: usize,
}

impl OmeMetadata {
    pub fn new(summary: &SummaryInfo) -> Self {
        let mut ome = Self {
            width: summary.width,
            height: summary.height,
            pixel_type: summary.pixel_type,
            channels: summary.channels,
            slices: summary.slices,
            frames: summary.frames,
            slices_first: summary.order.slices_first,
            pixel_size_um: None,
            channel_names: Vec::new(),
            positions: BTreeMap::new(),
            file_name_len: MIN_RESERVED_NAME_LEN,
            position_name_len: MIN_RESERVED_NAME_LEN,
            plane_len: 0,
            base_len: 0,
        };
        ome.refresh_estimates();
        ome
    }

    /// Attach channel names shown on `Channel` elements.
    pub fn with_channel_names(mut self, names: Vec<String>) -> Self {
        self.channel_names = names;
        self.refresh_estimates();
        self
    }

    fn refresh_estimates(&mut self) {
        let mut entry = String::new();
        write_tiff_data(
            &mut entry,
            &TiffDataEntry {
                ifd: u32::MAX,
                channel: u32::MAX,
                slice: u32::MAX,
                frame: u32::MAX,
                plane_count: 1,
                file: Some((
                    "x".repeat(self.file_name_len),
                    "urn:uuid:00000000-0000-0000-0000-000000000000".to_string(),
                )),
            },
        );
        self.plane_len = entry.len();

        let mut sample = Self {
            positions: BTreeMap::new(),
            channel_names: self.channel_names.clone(),
            ..*self
        };
        sample.positions.insert(
            u32::MAX,
            PositionPlanes {
                name: Some("x".repeat(self.position_name_len)),
                ..PositionPlanes::default()
            },
        );
        sample.pixel_size_um = Some(1.0e-3 / 3.0);
        self.base_len = sample.to_xml().len();
    }

    /// Widen the length estimates to cover `file_name` and `position_name`.
    ///
    /// Must be called with every name before space is checked for a plane
    /// that will carry it.
    pub fn reserve_names(&mut self, file_name: &str, position_name: Option<&str>) {
        let file_len = escape(file_name).len();
        let position_len = position_name.map(|n| escape(n).len()).unwrap_or(0);
        if file_len <= self.file_name_len && position_len <= self.position_name_len {
            return;
        }
        self.file_name_len = self.file_name_len.max(file_len);
        self.position_name_len = self.position_name_len.max(position_len);
        self.refresh_estimates();
    }

    /// Record the physical pixel size once it is known.
    pub fn set_pixel_size_um(&mut self, size: f64) {
        if size > 0.0 {
            self.pixel_size_um = Some(size);
        }
    }

    /// Record one written plane.
    #[allow(clippy::too_many_arguments)]
    pub fn add_plane(
        &mut self,
        position: u32,
        position_name: Option<&str>,
        channel: u32,
        slice: u32,
        frame: u32,
        ifd: u32,
        file_name: &str,
        uuid: &str,
    ) {
        self.reserve_names(file_name, position_name);
        let entry = self.positions.entry(position).or_default();
        if entry.name.is_none() {
            entry.name = position_name.map(str::to_string);
        }
        entry.seen.insert((channel, slice, frame));
        entry.planes.push(TiffDataEntry {
            ifd,
            channel,
            slice,
            frame,
            plane_count: 1,
            file: Some((file_name.to_string(), uuid.to_string())),
        });
    }

    /// Declare every (channel, slice) of `frame` that has no plane yet.
    pub fn fill_in_missing_tiff_datas(&mut self, frame: u32, position: u32) {
        let (channels, slices) = (self.channels, self.slices);
        let entry = self.positions.entry(position).or_default();
        for c in 0..channels {
            for z in 0..slices {
                if entry.seen.insert((c, z, frame)) {
                    entry.planes.push(TiffDataEntry {
                        ifd: 0,
                        channel: c,
                        slice: z,
                        frame,
                        plane_count: 0,
                        file: None,
                    });
                }
            }
        }
    }

    /// Override `SizeT` for one position.
    pub fn set_num_frames(&mut self, position: u32, frames: u32) {
        self.positions.entry(position).or_default().num_frames = Some(frames);
    }

    /// Planes recorded for a position, in write order.
    pub fn planes(&self, position: u32) -> &[TiffDataEntry] {
        self.positions
            .get(&position)
            .map(|p| p.planes.as_slice())
            .unwrap_or(&[])
    }

    /// Upper bound on the XML length of one plane entry.
    pub fn plane_entry_len(&self) -> usize {
        self.plane_len
    }

    /// Upper bound on the XML length of one position without its planes.
    pub fn base_len(&self) -> usize {
        self.base_len
    }

    /// Worst-case XML growth for `total_planes` planes across `positions`.
    pub fn estimate_len(&self, total_planes: u64, positions: u32) -> u64 {
        total_planes * self.plane_entry_len() as u64 + positions as u64 * self.base_len() as u64
    }

    /// Render the document.
    pub fn to_xml(&self) -> String {
        let dimension_order = if self.slices_first { "XYZCT" } else { "XYCZT" };
        let (pixel_type, samples) = match self.pixel_type {
            PixelType::Gray8 => ("uint8", 1),
            PixelType::Gray16 => ("uint16", 1),
            PixelType::Gray32 => ("float", 1),
            PixelType::Rgb32 => ("uint8", 3),
            PixelType::Rgb64 => ("uint16", 3),
        };

        let mut out = String::new();
        let _ = write!(
            out,
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
             <OME xmlns=\"{}\" xmlns:xsi=\"{}\" xsi:schemaLocation=\"{}\">",
            OME_NAMESPACE, XSI_NAMESPACE, SCHEMA_LOCATION
        );

        for (index, (position, planes)) in self.positions.iter().enumerate() {
            let name = planes
                .name
                .clone()
                .unwrap_or_else(|| format!("pos{}", position));
            let size_t = planes.num_frames.unwrap_or(self.frames).max(1);
            let _ = write!(
                out,
                "<Image ID=\"Image:{idx}\" Name=\"{name}\"><Pixels ID=\"Pixels:{idx}\" \
                 DimensionOrder=\"{order}\" Type=\"{ty}\" SizeX=\"{x}\" SizeY=\"{y}\" \
                 SizeZ=\"{z}\" SizeC=\"{c}\" SizeT=\"{t}\" BigEndian=\"true\"",
                idx = index,
                name = escape(&name),
                order = dimension_order,
                ty = pixel_type,
                x = self.width,
                y = self.height,
                z = self.slices,
                c = self.channels,
                t = size_t,
            );
            if let Some(size) = self.pixel_size_um {
                let _ = write!(
                    out,
                    " PhysicalSizeX=\"{0}\" PhysicalSizeY=\"{0}\"",
                    size
                );
            }
            out.push('>');

            for c in 0..self.channels {
                let _ = write!(
                    out,
                    "<Channel ID=\"Channel:{}:{}\" SamplesPerPixel=\"{}\"",
                    index, c, samples
                );
                if let Some(name) = self.channel_names.get(c as usize) {
                    let _ = write!(out, " Name=\"{}\"", escape(name));
                }
                out.push_str("/>");
            }
            for plane in &planes.planes {
                write_tiff_data(&mut out, plane);
            }
            out.push_str("</Pixels></Image>");
        }
        out.push_str("</OME>");
        out
    }
}

fn write_tiff_data(out: &mut String, plane: &TiffDataEntry) {
    let _ = write!(
        out,
        "<TiffData IFD=\"{}\" FirstC=\"{}\" FirstZ=\"{}\" FirstT=\"{}\" PlaneCount=\"{}\"",
        plane.ifd, plane.channel, plane.slice, plane.frame, plane.plane_count
    );
    match &plane.file {
        Some((file_name, uuid)) => {
            let _ = write!(
                out,
                "><UUID FileName=\"{}\">{}</UUID></TiffData>",
                escape(file_name),
                escape(uuid)
            );
        }
        None => out.push_str("/>"),
    }
}

/// Escape text for use in XML attributes and content.
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

// =============================================================================
// Tests
// =============================================================================
