use ratatui::layout::{Constraint, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::Paragraph;
use ratatui::Frame;

use crate::fmt::money;

pub const HEADER_STYLE: Style = Style::new()
    .fg(Color::Yellow)
    .add_modifier(Modifier::BOLD);

pub const FOOTER_STYLE: Style = Style::new().fg(Color::DarkGray);

pub const SEPARATOR_STYLE: Style = Style::new().fg(Color::DarkGray);

pub const DEBT_STYLE: Style = Style::new().fg(Color::Red);
pub const CLEAR_STYLE: Style = Style::new().fg(Color::Rgb(80, 220, 100));

pub const ERROR_STYLE: Style = Style::new().fg(Color::Red).add_modifier(Modifier::BOLD);
pub const NOTICE_STYLE: Style = Style::new().fg(Color::Yellow);
pub const MUTED_STYLE: Style = Style::new().fg(Color::DarkGray);

pub const SELECTED_STYLE: Style = Style::new()
    .bg(Color::Rgb(40, 40, 60))
    .add_modifier(Modifier::BOLD);

/// Amount owed as a colored Span: red while something is outstanding, green at zero.
pub fn money_span(amount: f64) -> Span<'static> {
    let style = if amount > 0.0 { DEBT_STYLE } else { CLEAR_STYLE };
    Span::styled(money(amount), style)
}

/// Wrap text to a given width. Returns (wrapped_string, line_count).
pub fn wrap_text(text: &str, width: usize) -> (String, u16) {
    if width == 0 {
        return (text.to_string(), 1);
    }
    let wrapped = textwrap::fill(text, width);
    let lines = wrapped.lines().count().max(1) as u16;
    (wrapped, lines)
}

/// Standard screen frame: title, separator, body, separator, footer.
/// Returns the body area.
pub fn chrome(frame: &mut Frame, title: &str, footer: Line<'_>) -> Rect {
    let area = frame.area();
    let [header_area, sep1, body, sep2, footer_area] = Layout::vertical([
        Constraint::Length(1),
        Constraint::Length(1),
        Constraint::Fill(1),
        Constraint::Length(1),
        Constraint::Length(1),
    ])
    .areas(area);

    frame.render_widget(Paragraph::new(format!(" {title}")).style(HEADER_STYLE), header_area);
    let sep_line = "━".repeat(area.width as usize);
    let sep = Paragraph::new(sep_line.as_str()).style(SEPARATOR_STYLE);
    frame.render_widget(sep.clone(), sep1);
    frame.render_widget(sep, sep2);
    frame.render_widget(Paragraph::new(footer), footer_area);
    body
}

/// Footer line: an error or notice if one is set, otherwise key hints.
pub fn footer_line<'a>(error: Option<&'a str>, notice: Option<&'a str>, hints: &'a str) -> Line<'a> {
    if let Some(err) = error {
        Line::from(Span::styled(format!(" {err}"), ERROR_STYLE))
    } else if let Some(msg) = notice {
        Line::from(Span::styled(format!(" {msg}"), NOTICE_STYLE))
    } else {
        Line::from(Span::styled(format!(" {hints}"), FOOTER_STYLE))
    }
}

/// Keep `selection` inside the window of `height` rows starting at `offset`.
pub fn scroll_offset(selection: usize, offset: usize, height: usize) -> usize {
    if height == 0 {
        return selection;
    }
    if selection < offset {
        selection
    } else if selection >= offset + height {
        selection + 1 - height
    } else {
        offset
    }
}

/// Restore the terminal before the default panic output is printed.
pub fn install_panic_hook() {
    let hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        ratatui::restore();
        hook(info);
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debt_is_red_and_zero_is_green() {
        assert_eq!(money_span(10.0).style, DEBT_STYLE);
        assert_eq!(money_span(0.0).style, CLEAR_STYLE);
        assert_eq!(money_span(12.5).content, "S/ 12.50");
    }

    #[test]
    fn wrap_counts_lines() {
        let (text, lines) = wrap_text("one two three four", 9);
        assert_eq!(lines, 2);
        assert!(text.contains('\n'));
        assert_eq!(wrap_text("x", 0).1, 1);
    }

    #[test]
    fn scroll_follows_selection() {
        assert_eq!(scroll_offset(0, 0, 5), 0);
        assert_eq!(scroll_offset(7, 0, 5), 3);
        assert_eq!(scroll_offset(2, 3, 5), 2);
        assert_eq!(scroll_offset(4, 2, 5), 2);
    }
}
