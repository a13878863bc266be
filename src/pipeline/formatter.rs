//! Platform-specific message rendering.

use crate::pipeline::normalizer::NormalizedMessage;
use crate::platforms::Platform;

/// Render a normalized message in the target platform's markup.
pub fn format_for_platform(message: &NormalizedMessage, platform: Platform) -> String {
    match platform {
        Platform::Telegram => format_telegram(message),
        Platform::Slack => format_slack(message),
    }
}

/// Telegram HTML parse mode.
fn format_telegram(message: &NormalizedMessage) -> String {
    format!(
        "📧 <b>New Email</b>\n\n\
         <b>From:</b> {}\n\
         <b>To:</b> {}\n\
         <b>Subject:</b> {}\n\
         <b>Date:</b> {}\n\n\
         <b>Message:</b>\n{}",
        escape_html(&message.from),
        escape_html(&message.to),
        escape_html(&message.subject),
        escape_html(&message.date),
        escape_html(&message.body),
    )
}

/// Slack mrkdwn; the body goes in a preformatted block.
fn format_slack(message: &NormalizedMessage) -> String {
    format!(
        ":email: *New Email*\n\n\
         *From:* {}\n\
         *To:* {}\n\
         *Subject:* {}\n\
         *Date:* {}\n\n\
         *Message:*\n```\n{}\n```",
        message.from, message.to, message.subject, message.date, message.body,
    )
}

/// Escape the characters Telegram's HTML mode treats as markup.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> NormalizedMessage {
        NormalizedMessage {
            from: "alice@example.com".into(),
            to: "123456789@telegram".into(),
            subject: "Q3 <draft> & notes".into(),
            date: "2024-03-01 09:30:00 UTC".into(),
            body: "if a < b && c > d { say \"hi\" }".into(),
        }
    }

    #[test]
    fn escape_html_covers_markup_characters() {
        assert_eq!(escape_html(r#"<a href="x">&</a>"#), "&lt;a href=&quot;x&quot;&gt;&amp;&lt;/a&gt;");
        assert_eq!(escape_html("plain 'text'"), "plain 'text'");
    }

    #[test]
    fn telegram_layout_is_escaped_html() {
        let text = format_for_platform(&sample(), Platform::Telegram);
        assert_eq!(
            text,
            "📧 <b>New Email</b>\n\n\
             <b>From:</b> alice@example.com\n\
             <b>To:</b> 123456789@telegram\n\
             <b>Subject:</b> Q3 &lt;draft&gt; &amp; notes\n\
             <b>Date:</b> 2024-03-01 09:30:00 UTC\n\n\
             <b>Message:</b>\n\
             if a &lt; b &amp;&amp; c &gt; d { say &quot;hi&quot; }"
        );
    }

    #[test]
    fn slack_layout_wraps_body_in_code_block() {
        let text = format_for_platform(&sample(), Platform::Slack);
        assert!(text.starts_with(":email: *New Email*\n\n*From:* alice@example.com\n"));
        assert!(text.contains("*Subject:* Q3 <draft> & notes\n"));
        assert!(text.ends_with("*Message:*\n```\nif a < b && c > d { say \"hi\" }\n```"));
    }
}
