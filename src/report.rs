//! Terminal rendering for [`Diagnostic`]s (EXPANSION 2.1 "ambient stack" —
//! error reporting still gets a real terminal surface even though lexing
//! and snippet rendering are out of this crate's scope).
//!
//! This core only carries level/message/line, so unlike the teacher's
//! richer formatter (source snippets, caret indicators, related-location
//! notes) there is just a header line to color; the structure — a
//! `ColorMode` that respects `NO_COLOR`, a `WriteColor` sink, a plain-string
//! fallback — is kept the same.

use crate::error::{Diagnostic, DiagnosticLevel};
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};

/// How eagerly to colorize diagnostic output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorMode {
    Always,
    Never,
    Auto,
}

impl ColorMode {
    fn to_color_choice(self) -> ColorChoice {
        if std::env::var("NO_COLOR").is_ok() {
            return ColorChoice::Never;
        }
        match self {
            ColorMode::Always => ColorChoice::Always,
            ColorMode::Never => ColorChoice::Never,
            ColorMode::Auto => ColorChoice::Auto,
        }
    }
}

/// Renders diagnostics to a terminal stream, or plainly when colors are off.
pub struct DiagnosticFormatter {
    color_mode: ColorMode,
}

impl DiagnosticFormatter {
    pub fn new(color_mode: ColorMode) -> Self {
        Self { color_mode }
    }

    pub fn auto() -> Self {
        Self::new(ColorMode::Auto)
    }

    pub fn plain() -> Self {
        Self::new(ColorMode::Never)
    }

    /// Write every diagnostic to stderr, colored per `self.color_mode`.
    pub fn emit_all(&self, diagnostics: &[Diagnostic]) {
        let mut stream = StandardStream::stderr(self.color_mode.to_color_choice());
        for diag in diagnostics {
            let _ = self.write_diagnostic(&mut stream, diag);
        }
    }

    pub fn write_diagnostic(&self, w: &mut impl WriteColor, diag: &Diagnostic) -> std::io::Result<()> {
        let (color, label) = match diag.level {
            DiagnosticLevel::Error => (Color::Red, "error"),
            DiagnosticLevel::Warning => (Color::Yellow, "warning"),
        };
        w.set_color(ColorSpec::new().set_fg(Some(color)).set_bold(true))?;
        write!(w, "{label}")?;
        w.reset()?;
        writeln!(w, ": {} (line {})", diag.message, diag.line)
    }

    pub fn format_to_string(&self, diag: &Diagnostic) -> String {
        format!("{}: {} (line {})", diag.level, diag.message, diag.line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use termcolor::Buffer;

    #[test]
    fn plain_render_contains_level_message_and_line() {
        let diag = Diagnostic::error("undeclared name 'x'", 7);
        let fmt = DiagnosticFormatter::plain();
        let mut buf = Buffer::no_color();
        fmt.write_diagnostic(&mut buf, &diag).unwrap();
        let rendered = String::from_utf8(buf.into_inner()).unwrap();
        assert!(rendered.contains("error"));
        assert!(rendered.contains("undeclared name 'x'"));
        assert!(rendered.contains("7"));
    }
}
