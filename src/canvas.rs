use crate::font::{EncodedText, ResolvedFont};
use crate::template::TemplateImage;
use crate::types::{Color, Pt};
use std::sync::Arc;

// Cubic Bezier control distance for a quarter ellipse.
const KAPPA: f64 = 0.552_284_749_8;

/// Drawing operations in PDF user space (origin bottom-left, y up).
#[derive(Debug, Clone)]
pub(crate) enum Command {
    SaveState,
    RestoreState,
    SetFillColor(Color),
    SetStrokeColor(Color),
    SetLineWidth(Pt),
    SetFont {
        font: ResolvedFont,
        size: Pt,
    },
    MoveTo {
        x: Pt,
        y: Pt,
    },
    LineTo {
        x: Pt,
        y: Pt,
    },
    CurveTo {
        x1: Pt,
        y1: Pt,
        x2: Pt,
        y2: Pt,
        x: Pt,
        y: Pt,
    },
    ClosePath,
    Fill,
    Stroke,
    DrawRect {
        x: Pt,
        y: Pt,
        width: Pt,
        height: Pt,
    },
    /// Text encoded for the current font, baseline origin at `(x, y)`.
    DrawString {
        x: Pt,
        y: Pt,
        text: EncodedText,
    },
    DrawImage {
        x: Pt,
        y: Pt,
        width: Pt,
        height: Pt,
        image: Arc<TemplateImage>,
    },
}

/// A finished single-page drawing.
#[derive(Debug, Clone)]
pub(crate) struct Document {
    pub width: Pt,
    pub height: Pt,
    pub commands: Vec<Command>,
}

#[derive(Debug, Clone)]
struct GraphicsState {
    fill_color: Color,
    stroke_color: Color,
    line_width: Pt,
    font: Option<(String, Pt)>,
}

impl GraphicsState {
    fn initial() -> Self {
        Self {
            fill_color: Color::BLACK,
            stroke_color: Color::BLACK,
            line_width: Pt::from_f64(1.0),
            font: None,
        }
    }
}

pub(crate) struct Canvas {
    width: Pt,
    height: Pt,
    commands: Vec<Command>,
    state_stack: Vec<GraphicsState>,
    current_state: GraphicsState,
}

impl Canvas {
    pub fn new(width: Pt, height: Pt) -> Self {
        Self {
            width,
            height,
            commands: Vec::new(),
            state_stack: Vec::new(),
            current_state: GraphicsState::initial(),
        }
    }

    pub fn save_state(&mut self) {
        self.state_stack.push(self.current_state.clone());
        self.commands.push(Command::SaveState);
    }

    pub fn restore_state(&mut self) {
        if let Some(state) = self.state_stack.pop() {
            self.current_state = state;
            self.commands.push(Command::RestoreState);
        }
    }

    pub fn set_fill_color(&mut self, color: Color) {
        if self.current_state.fill_color == color {
            return;
        }
        self.current_state.fill_color = color;
        self.commands.push(Command::SetFillColor(color));
    }

    pub fn set_stroke_color(&mut self, color: Color) {
        if self.current_state.stroke_color == color {
            return;
        }
        self.current_state.stroke_color = color;
        self.commands.push(Command::SetStrokeColor(color));
    }

    pub fn set_line_width(&mut self, width: Pt) {
        let width = width.max(Pt::ZERO);
        if self.current_state.line_width == width {
            return;
        }
        self.current_state.line_width = width;
        self.commands.push(Command::SetLineWidth(width));
    }

    pub fn set_font(&mut self, font: &ResolvedFont, size: Pt) {
        let key = (font.resource_key(), size);
        if self.current_state.font.as_ref() == Some(&key) {
            return;
        }
        self.current_state.font = Some(key);
        self.commands.push(Command::SetFont {
            font: font.clone(),
            size,
        });
    }

    pub fn move_to(&mut self, x: Pt, y: Pt) {
        self.commands.push(Command::MoveTo { x, y });
    }

    pub fn line_to(&mut self, x: Pt, y: Pt) {
        self.commands.push(Command::LineTo { x, y });
    }

    pub fn curve_to(&mut self, x1: Pt, y1: Pt, x2: Pt, y2: Pt, x: Pt, y: Pt) {
        self.commands.push(Command::CurveTo {
            x1,
            y1,
            x2,
            y2,
            x,
            y,
        });
    }

    pub fn close_path(&mut self) {
        self.commands.push(Command::ClosePath);
    }

    pub fn fill(&mut self) {
        self.commands.push(Command::Fill);
    }

    pub fn stroke(&mut self) {
        self.commands.push(Command::Stroke);
    }

    pub fn draw_rect(&mut self, x: Pt, y: Pt, width: Pt, height: Pt) {
        self.commands.push(Command::DrawRect {
            x,
            y,
            width,
            height,
        });
    }

    /// Appends an ellipse inscribed in the given box as four cubic curves.
    pub fn ellipse(&mut self, x: Pt, y: Pt, width: Pt, height: Pt) {
        let rx = width.to_f64() / 2.0;
        let ry = height.to_f64() / 2.0;
        let cx = x.to_f64() + rx;
        let cy = y.to_f64() + ry;
        let ox = rx * KAPPA;
        let oy = ry * KAPPA;
        let p = Pt::from_f64;
        self.move_to(p(cx + rx), p(cy));
        self.curve_to(p(cx + rx), p(cy + oy), p(cx + ox), p(cy + ry), p(cx), p(cy + ry));
        self.curve_to(p(cx - ox), p(cy + ry), p(cx - rx), p(cy + oy), p(cx - rx), p(cy));
        self.curve_to(p(cx - rx), p(cy - oy), p(cx - ox), p(cy - ry), p(cx), p(cy - ry));
        self.curve_to(p(cx + ox), p(cy - ry), p(cx + rx), p(cy - oy), p(cx + rx), p(cy));
        self.close_path();
    }

    pub fn draw_string(&mut self, x: Pt, y: Pt, text: EncodedText) {
        self.commands.push(Command::DrawString { x, y, text });
    }

    pub fn draw_image(&mut self, x: Pt, y: Pt, width: Pt, height: Pt, image: Arc<TemplateImage>) {
        self.commands.push(Command::DrawImage {
            x,
            y,
            width,
            height,
            image,
        });
    }

    pub fn finish(mut self) -> Document {
        while !self.state_stack.is_empty() {
            self.restore_state();
        }
        Document {
            width: self.width,
            height: self.height,
            commands: self.commands,
        }
    }
}
