//! Serialization of laid-out pages into a PDF document.

use super::layout::{DrawOp, Font, Page};
use image::{DynamicImage, ImageFormat};
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Dictionary, Document, Object, ObjectId, Stream};
use std::io::Cursor;
use thiserror::Error;

/// Errors raised while serializing the document
#[derive(Debug, Error)]
pub enum PdfError {
    #[error("page references unknown image {0}")]
    UnknownImage(usize),

    #[error("failed to encode document: {0}")]
    Encode(String),
}

/// A JPEG ready to be embedded as a DCT-encoded image XObject
#[derive(Debug, Clone)]
pub struct EmbeddedImage {
    pub jpeg: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub gray: bool,
}

impl EmbeddedImage {
    /// Decode an uploaded image; JPEGs are embedded as-is, anything else is re-encoded
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, image::ImageError> {
        let format = image::guess_format(&bytes)?;
        let decoded = image::load_from_memory(&bytes)?;
        let channels = decoded.color().channel_count();

        if format == ImageFormat::Jpeg && matches!(channels, 1 | 3) {
            return Ok(Self {
                width: decoded.width(),
                height: decoded.height(),
                gray: channels == 1,
                jpeg: bytes,
            });
        }

        let rgb = DynamicImage::ImageRgb8(decoded.to_rgb8());
        let mut jpeg = Vec::new();
        rgb.write_to(&mut Cursor::new(&mut jpeg), ImageFormat::Jpeg)?;
        Ok(Self {
            width: rgb.width(),
            height: rgb.height(),
            gray: false,
            jpeg,
        })
    }

    pub fn pixel_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

/// Write pages into a single PDF byte buffer
pub fn render_pdf(
    pages: &[Page],
    images: &[EmbeddedImage],
    page_width: f32,
    page_height: f32,
) -> Result<Vec<u8>, PdfError> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();

    let font = Font::Helvetica;
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => font.base_font(),
        "Encoding" => "WinAnsiEncoding",
    });

    let image_ids: Vec<ObjectId> = images
        .iter()
        .map(|img| {
            let color_space = if img.gray { "DeviceGray" } else { "DeviceRGB" };
            let stream = Stream::new(
                dictionary! {
                    "Type" => "XObject",
                    "Subtype" => "Image",
                    "Width" => img.width as i64,
                    "Height" => img.height as i64,
                    "ColorSpace" => color_space,
                    "BitsPerComponent" => 8i64,
                    "Filter" => "DCTDecode",
                },
                img.jpeg.clone(),
            );
            doc.add_object(stream)
        })
        .collect();

    let mut kids = Vec::with_capacity(pages.len());
    for page in pages {
        let mut operations = Vec::new();
        let mut xobjects = Dictionary::new();

        for op in &page.ops {
            match op {
                DrawOp::Text {
                    x,
                    y,
                    font,
                    size,
                    word_spacing,
                    text,
                } => {
                    // PDF places text by its baseline, measured from the bottom edge
                    let baseline = page_height - y - size * 0.8;
                    operations.push(Operation::new("BT", vec![]));
                    operations.push(Operation::new(
                        "Tf",
                        vec![font.resource_name().into(), Object::Real(*size)],
                    ));
                    operations.push(Operation::new("Tw", vec![Object::Real(*word_spacing)]));
                    operations.push(Operation::new(
                        "Td",
                        vec![Object::Real(*x), Object::Real(baseline)],
                    ));
                    operations.push(Operation::new(
                        "Tj",
                        vec![Object::string_literal(win_ansi(text))],
                    ));
                    operations.push(Operation::new("ET", vec![]));
                }
                DrawOp::Image {
                    image,
                    x,
                    y,
                    width,
                    height,
                } => {
                    let image_id = image_ids
                        .get(image.0)
                        .ok_or(PdfError::UnknownImage(image.0))?;
                    let name = format!("Im{}", image.0);
                    xobjects.set(name.as_bytes().to_vec(), Object::Reference(*image_id));

                    let bottom = page_height - y - height;
                    operations.push(Operation::new("q", vec![]));
                    operations.push(Operation::new(
                        "cm",
                        vec![
                            Object::Real(*width),
                            Object::Integer(0),
                            Object::Integer(0),
                            Object::Real(*height),
                            Object::Real(*x),
                            Object::Real(bottom),
                        ],
                    ));
                    operations.push(Operation::new("Do", vec![Object::Name(name.into_bytes())]));
                    operations.push(Operation::new("Q", vec![]));
                }
            }
        }

        let content = Content { operations };
        let encoded = content
            .encode()
            .map_err(|e| PdfError::Encode(e.to_string()))?;
        let content_id = doc.add_object(Stream::new(Dictionary::new(), encoded));
        let resources_id = doc.add_object(dictionary! {
            "Font" => dictionary! {
                font.resource_name() => font_id,
            },
            "XObject" => xobjects,
        });
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
            "Resources" => resources_id,
        });
        kids.push(Object::Reference(page_id));
    }

    let page_count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => page_count,
            "MediaBox" => vec![
                Object::Integer(0),
                Object::Integer(0),
                Object::Real(page_width),
                Object::Real(page_height),
            ],
        }),
    );

    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut buffer = Vec::new();
    doc.save_to(&mut buffer)
        .map_err(|e| PdfError::Encode(e.to_string()))?;
    Ok(buffer)
}

/// Map text to single-byte WinAnsi codes; characters outside Latin-1 become '?'
fn win_ansi(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| {
            let code = c as u32;
            if code < 256 {
                code as u8
            } else {
                b'?'
            }
        })
        .collect()
}
