//! Page layout for the inspection report.
//!
//! Coordinates are in points with the origin at the top-left corner of the page; the
//! PDF writer flips them. The canvas keeps a text cursor and an active font the way a
//! flowing document does: free-flowing text is placed at the cursor and advances it.

/// A4 portrait, in points
pub const A4_WIDTH: f32 = 595.28;
pub const A4_HEIGHT: f32 = 841.89;

/// Distance of the footer line from the bottom edge
const FOOTER_OFFSET: f32 = 80.0;
/// Space kept clear above the footer by flowing text
const FOOTER_GAP: f32 = 10.0;

/// Fonts available to the report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Font {
    Helvetica,
}

impl Font {
    /// Resource name used in the PDF page dictionary
    pub fn resource_name(&self) -> &'static str {
        match self {
            Font::Helvetica => "F1",
        }
    }

    pub fn base_font(&self) -> &'static str {
        match self {
            Font::Helvetica => "Helvetica",
        }
    }

    /// Advance width of a string in points
    pub fn text_width(&self, text: &str, size: f32) -> f32 {
        let units: u32 = text.chars().map(helvetica_width).sum();
        units as f32 * size / 1000.0
    }
}

/// Helvetica AFM advance widths for printable ASCII, in 1/1000 em
const HELVETICA_WIDTHS: [u16; 95] = [
    278, 278, 355, 556, 556, 889, 667, 191, 333, 333, 389, 584, 278, 333, 278, 278, // ' '..'/'
    556, 556, 556, 556, 556, 556, 556, 556, 556, 556, // '0'..'9'
    278, 278, 584, 584, 584, 556, 1015, // ':'..'@'
    667, 667, 722, 722, 667, 611, 778, 722, 278, 500, 667, 556, 833, // 'A'..'M'
    722, 778, 667, 778, 722, 667, 611, 722, 667, 944, 667, 667, 611, // 'N'..'Z'
    278, 278, 278, 469, 556, 333, // '['..'`'
    556, 556, 500, 556, 556, 278, 556, 556, 222, 222, 500, 222, 833, // 'a'..'m'
    556, 556, 556, 556, 333, 500, 278, 556, 500, 722, 500, 500, 500, // 'n'..'z'
    334, 260, 334, 584, // '{'..'~'
];

fn helvetica_width(c: char) -> u32 {
    let code = c as u32;
    if (32..127).contains(&code) {
        HELVETICA_WIDTHS[(code - 32) as usize] as u32
    } else {
        556
    }
}

/// Horizontal alignment of a text block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Align {
    Left,
    Center,
    Justify,
}

/// Page margins in points
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Margins {
    pub top: f32,
    pub bottom: f32,
    pub left: f32,
    pub right: f32,
}

impl Margins {
    pub fn uniform(value: f32) -> Self {
        Self {
            top: value,
            bottom: value,
            left: value,
            right: value,
        }
    }
}

/// Index of an image registered with the document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageId(pub usize);

/// One drawing instruction on a page
#[derive(Debug, Clone, PartialEq)]
pub enum DrawOp {
    /// A single line of text; `y` is the top of the line box
    Text {
        x: f32,
        y: f32,
        font: Font,
        size: f32,
        word_spacing: f32,
        text: String,
    },
    /// An image scaled into the given box; `y` is its top edge
    Image {
        image: ImageId,
        x: f32,
        y: f32,
        width: f32,
        height: f32,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub ops: Vec<DrawOp>,
}

impl Page {
    /// Text of every line on the page, in drawing order
    pub fn text_lines(&self) -> impl Iterator<Item = &str> {
        self.ops.iter().filter_map(|op| match op {
            DrawOp::Text { text, .. } => Some(text.as_str()),
            DrawOp::Image { .. } => None,
        })
    }
}

/// Cursor position and active font; everything free-flowing text depends on
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LayoutState {
    pub cursor_y: f32,
    pub font: Font,
    pub font_size: f32,
}

const LINE_GAP: f32 = 0.2;

/// A sequence of pages under construction
#[derive(Debug, Clone)]
pub struct Canvas {
    width: f32,
    height: f32,
    margins: Margins,
    state: LayoutState,
    pages: Vec<Page>,
    running_footer: Option<String>,
}

impl Canvas {
    /// A canvas with one empty page and the cursor at the top margin
    pub fn new(width: f32, height: f32, margins: Margins) -> Self {
        Self {
            width,
            height,
            margins,
            state: LayoutState {
                cursor_y: margins.top,
                font: Font::Helvetica,
                font_size: 12.0,
            },
            pages: vec![Page::default()],
            running_footer: None,
        }
    }

    pub fn a4() -> Self {
        Self::new(A4_WIDTH, A4_HEIGHT, Margins::uniform(50.0))
    }

    pub fn width(&self) -> f32 {
        self.width
    }

    pub fn height(&self) -> f32 {
        self.height
    }

    pub fn margins(&self) -> Margins {
        self.margins
    }

    /// Width between the left and right margins
    pub fn content_width(&self) -> f32 {
        self.width - self.margins.left - self.margins.right
    }

    pub fn state(&self) -> LayoutState {
        self.state
    }

    pub fn pages(&self) -> &[Page] {
        &self.pages
    }

    pub fn into_pages(self) -> Vec<Page> {
        self.pages
    }

    pub fn set_font(&mut self, font: Font, size: f32) -> &mut Self {
        self.state.font = font;
        self.state.font_size = size;
        self
    }

    pub fn set_cursor_y(&mut self, y: f32) -> &mut Self {
        self.state.cursor_y = y;
        self
    }

    /// Height of one line in the active font
    pub fn line_height(&self) -> f32 {
        self.state.font_size * (1.0 + LINE_GAP)
    }

    /// Advance the cursor by a number of lines of the active font
    pub fn move_down(&mut self, lines: f32) -> &mut Self {
        self.state.cursor_y += lines * self.line_height();
        self
    }

    /// Footer drawn on a page that flowing text leaves because it ran out of room
    pub fn set_running_footer(&mut self, text: &str) -> &mut Self {
        self.running_footer = Some(text.to_string());
        self
    }

    /// Lowest point flowing text may reach before it continues on a new page
    pub fn flow_bottom(&self) -> f32 {
        self.height - FOOTER_OFFSET - FOOTER_GAP
    }

    /// Start a new page with the cursor at the top margin; the font carries over
    pub fn add_page(&mut self) -> &mut Self {
        self.pages.push(Page::default());
        self.state.cursor_y = self.margins.top;
        self
    }

    /// Flow a paragraph at the cursor across the content width, breaking onto new pages
    /// when it would run into the footer
    pub fn text(&mut self, text: &str, align: Align) -> &mut Self {
        let x = self.margins.left;
        let width = self.content_width();
        let y = self.state.cursor_y;
        self.place_text(text, x, y, width, align, true)
    }

    /// Place a paragraph in a box starting at (`x`, `y`); the cursor ends below it
    pub fn text_at(&mut self, text: &str, x: f32, y: f32, width: f32, align: Align) -> &mut Self {
        self.place_text(text, x, y, width, align, false)
    }

    fn place_text(
        &mut self,
        text: &str,
        x: f32,
        y: f32,
        width: f32,
        align: Align,
        paginate: bool,
    ) -> &mut Self {
        let font = self.state.font;
        let size = self.state.font_size;
        let line_height = self.line_height();
        let lines = wrap_words(text, font, size, width);
        let last = lines.len().saturating_sub(1);

        let mut line_y = y;
        for (i, words) in lines.iter().enumerate() {
            if paginate && line_y + line_height > self.flow_bottom() && line_y > self.margins.top {
                self.break_page();
                line_y = self.state.cursor_y;
            }
            let line = words.join(" ");
            let line_width = font.text_width(&line, size);
            let (line_x, word_spacing) = match align {
                Align::Left => (x, 0.0),
                Align::Center => (x + ((width - line_width) / 2.0).max(0.0), 0.0),
                Align::Justify if i < last && words.len() > 1 => {
                    let gaps = (words.len() - 1) as f32;
                    (x, ((width - line_width) / gaps).max(0.0))
                }
                Align::Justify => (x, 0.0),
            };
            self.current_page().ops.push(DrawOp::Text {
                x: line_x,
                y: line_y,
                font,
                size,
                word_spacing,
                text: line,
            });
            line_y += line_height;
        }

        self.state.cursor_y = line_y;
        self
    }

    /// Draw an image fitted inside the box, preserving its aspect ratio and centered
    /// horizontally within the box
    pub fn image_fit(
        &mut self,
        image: ImageId,
        pixel_size: (u32, u32),
        x: f32,
        y: f32,
        box_width: f32,
        box_height: f32,
    ) -> &mut Self {
        let (px_w, px_h) = pixel_size;
        let (width, height) = if px_w == 0 || px_h == 0 {
            (box_width, box_height)
        } else {
            let scale = (box_width / px_w as f32).min(box_height / px_h as f32);
            (px_w as f32 * scale, px_h as f32 * scale)
        };
        self.current_page().ops.push(DrawOp::Image {
            image,
            x: x + (box_width - width) / 2.0,
            y,
            width,
            height,
        });
        self
    }

    /// Run `draw` and then put the cursor and font back exactly as they were
    pub fn with_saved_state<F>(&mut self, draw: F) -> &mut Self
    where
        F: FnOnce(&mut Canvas),
    {
        let saved = self.state;
        draw(self);
        self.state = saved;
        self
    }

    /// Draw the footer near the bottom of the current page without disturbing the
    /// layout state subsequent content relies on
    pub fn footer(&mut self, text: &str) -> &mut Self {
        let x = self.margins.left;
        let width = self.content_width();
        let y = self.height - FOOTER_OFFSET;
        self.with_saved_state(|canvas| {
            canvas
                .set_font(Font::Helvetica, 8.0)
                .text_at(text, x, y, width, Align::Center);
        })
    }

    fn break_page(&mut self) {
        if let Some(footer) = self.running_footer.clone() {
            self.footer(&footer);
        }
        self.add_page();
    }

    fn current_page(&mut self) -> &mut Page {
        if self.pages.is_empty() {
            self.pages.push(Page::default());
        }
        let last = self.pages.len() - 1;
        &mut self.pages[last]
    }
}

/// Greedy word wrap; a word wider than the box gets a line of its own
fn wrap_words(text: &str, font: Font, size: f32, width: f32) -> Vec<Vec<String>> {
    let mut lines = Vec::new();

    for paragraph in text.split('\n') {
        let mut line: Vec<String> = Vec::new();
        let mut line_width = 0.0;
        let space = font.text_width(" ", size);

        for word in paragraph.split_whitespace() {
            let word_width = font.text_width(word, size);
            let needed = if line.is_empty() {
                word_width
            } else {
                line_width + space + word_width
            };
            if needed > width && !line.is_empty() {
                lines.push(std::mem::take(&mut line));
                line_width = word_width;
            } else {
                line_width = needed;
            }
            line.push(word.to_string());
        }

        lines.push(line);
    }

    lines
}
