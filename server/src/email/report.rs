//! Report rendering.
//!
//! Subject and body for both email kinds. The body is a compact HTML
//! summary with a plain-text alternative; heavyweight attachments are
//! out of scope here.

use anyhow::Context;
use lettre::message::MultiPart;
use minijinja::render;
use serde::Serialize;

use crate::email::NotificationPayload;
use crate::events::Severity;
use crate::store::StoredResult;

const NOTIFICATION_EMAIL_TEMPLATE: &str = r#"<html>
<body>
<h2>{{ customer_name }} Cloud Health Events Analysis</h2>
{% if manual_review_count > 0 %}
<div style="background-color:#FFF3CD;padding:8px;border:1px solid #FF6B35;">
<strong>ATTENTION: Manual Review Required</strong>
<p>{{ manual_review_count }} account(s) require manual review due to AI analysis unavailability</p>
</div>
{% endif %}
<p>{{ total_events }} events across {{ total_accounts }} account(s){% if is_master %} (master report){% endif %}.</p>
<table border="1" cellpadding="4" cellspacing="0">
<tr><th>Account</th><th>Risk Level</th><th>Events</th><th>Summary</th>{% if is_master %}<th>Recipient</th>{% endif %}</tr>
{% for row in rows %}
<tr><td>{{ row.account_id }}</td><td>{{ row.risk_level }}</td><td>{{ row.event_count }}</td><td>{{ row.summary }}</td>{% if is_master %}<td>{{ row.recipient }}</td>{% endif %}</tr>
{% endfor %}
</table>
</body>
</html>"#;

#[derive(Debug, Serialize)]
struct ReportRow {
    account_id: String,
    risk_level: String,
    event_count: usize,
    summary: String,
    recipient: String,
}

#[derive(Debug)]
pub struct RenderedEmail {
    pub subject: String,
    pub html: String,
    pub plain: String,
}

fn severity_count(results: &[StoredResult], severity: Severity) -> usize {
    results
        .iter()
        .flat_map(|r| &r.payload.processed_events)
        .filter(|e| e.severity == severity)
        .count()
}

/// Subject line: severity counts decide the bracket tag, master
/// reports are labelled as such.
pub fn email_subject(payload: &NotificationPayload, customer_name: &str) -> String {
    let results = payload.results();
    let critical_events = severity_count(results, Severity::Critical);
    let high_events = severity_count(results, Severity::High);
    let total_events: usize = results.iter().map(|r| r.payload.event_count).sum();

    let prefix = if payload.is_master() {
        format!("{} [MASTER]", customer_name)
    } else {
        customer_name.to_string()
    };

    if critical_events > 0 {
        format!(
            "{} [CRITICAL] Cloud Health Events - {} Critical Events",
            prefix, critical_events
        )
    } else if high_events > 0 {
        format!(
            "{} [HIGH RISK] Cloud Health Events - {} High Priority Events",
            prefix, high_events
        )
    } else {
        format!(
            "{} Cloud Health Events Analysis - {} Events",
            prefix, total_events
        )
    }
}

/// Render subject, HTML body and plain-text alternative.
pub fn render_notification(payload: &NotificationPayload, customer_name: &str) -> RenderedEmail {
    let results = payload.results();

    let rows: Vec<ReportRow> = results
        .iter()
        .map(|r| ReportRow {
            account_id: r.account_id.clone(),
            risk_level: r.payload.analysis.risk_level.to_string(),
            event_count: r.payload.event_count,
            summary: r.payload.analysis.summary.clone(),
            recipient: r
                .payload
                .email_mapping
                .clone()
                .unwrap_or_else(|| "Default Recipients".to_string()),
        })
        .collect();

    let manual_review_count = results
        .iter()
        .filter(|r| r.payload.analysis.manual_review_required)
        .count();
    let total_events: usize = results.iter().map(|r| r.payload.event_count).sum();

    let html = render!(
        NOTIFICATION_EMAIL_TEMPLATE,
        customer_name => customer_name,
        manual_review_count => manual_review_count,
        total_events => total_events,
        total_accounts => results.len(),
        is_master => payload.is_master(),
        rows => &rows,
    );

    let mut plain = format!(
        "{} Cloud Health Events Analysis\n{} events across {} account(s).\n",
        customer_name,
        total_events,
        results.len()
    );
    if manual_review_count > 0 {
        plain.push_str(&format!(
            "ATTENTION: {} account(s) require manual review.\n",
            manual_review_count
        ));
    }
    for row in &rows {
        plain.push_str(&format!(
            "{}: {} risk, {} events - {}\n",
            row.account_id, row.risk_level, row.event_count, row.summary
        ));
    }

    RenderedEmail {
        subject: email_subject(payload, customer_name),
        html,
        plain,
    }
}

/// Assemble the MIME message for a rendered notification.
pub fn build_message(
    rendered: &RenderedEmail,
    from: &str,
    recipients: &[String],
    cc: Option<&str>,
) -> anyhow::Result<lettre::Message> {
    let mut builder = lettre::Message::builder()
        .from(from.parse().context("could not parse from address")?)
        .subject(rendered.subject.clone());

    for recipient in recipients {
        builder = builder.to(format!("<{}>", recipient)
            .parse()
            .context("could not parse recipient address")?);
    }
    if let Some(cc) = cc {
        builder = builder.cc(format!("<{}>", cc)
            .parse()
            .context("could not parse cc address")?);
    }

    let message = builder.multipart(MultiPart::alternative_plain_html(
        rendered.plain.clone(),
        rendered.html.clone(),
    ))?;

    Ok(message)
}
