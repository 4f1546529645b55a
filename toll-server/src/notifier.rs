use std::sync::Arc;

use async_trait::async_trait;
use chrono::Local;
use handlebars::Handlebars;
use miette::Diagnostic;
use serde_json::json;
use thiserror::Error;
use toll_core::account::format_amount;
use toll_core::{AccountNotifier, AccountRecord, NotificationFailure};

use crate::integrations::postmark::{PostmarkClient, PostmarkError, SendEmailRequest};
use crate::mask;

pub const DEFAULT_SENDER: &str = "E-ZPass Tolls <no-reply@tolls.local>";

const BALANCE_TEMPLATE: &str = "balance";
const BALANCE_TEMPLATE_HTML: &str = r#"<!DOCTYPE html>
<html>
<body style="font-family: Arial, sans-serif; color: #222;">
  <h2>E-ZPass Toll Information</h2>
  <p>{{date}}</p>
  {{#if has_ny}}
  <h3>New York</h3>
  <table>
    <tr><td>Account Number</td><td>{{account_number}}</td></tr>
    <tr><td>Plate Number</td><td>{{plate_number}}</td></tr>
    <tr><td>Balance</td><td>${{ny_balance_due}}</td></tr>
  </table>
  {{/if}}
  {{#if has_nj}}
  <h3>New Jersey</h3>
  <table>
    <tr><td>Violation Number</td><td>{{violation_number}}</td></tr>
    <tr><td>Plate Number</td><td>{{nj_plate_number}}</td></tr>
    <tr><td>Balance</td><td>${{nj_balance_due}}</td></tr>
  </table>
  {{/if}}
  <h3>Total Balance Due: ${{balance_due}}</h3>
  <p>Violations: {{violation_count}}</p>
  {{#if bill_numbers}}
  <p>Bill Numbers:</p>
  <ul>
    {{#each bill_numbers}}<li>{{this}}</li>{{/each}}
  </ul>
  {{else}}
  <p>Bill Numbers: None</p>
  {{/if}}
</body>
</html>
"#;

#[derive(Clone)]
pub struct Notifier {
    postmark_client: PostmarkClient,
    sender: String,
    templates: Arc<Handlebars<'static>>,
}

type Result<T> = miette::Result<T, NotifierError>;

#[derive(Error, Diagnostic, Debug)]
pub enum NotifierError {
    #[error("failed to register email template: {0}")]
    #[diagnostic(code(toll::notifier::template))]
    Template(#[from] Box<handlebars::TemplateError>),
    #[error("failed to render email: {0}")]
    #[diagnostic(code(toll::notifier::render))]
    Render(#[from] handlebars::RenderError),
    #[error(transparent)]
    #[diagnostic(code(toll::notifier::delivery))]
    Delivery(#[from] PostmarkError),
}

impl Notifier {
    pub fn new(postmark_client: PostmarkClient, sender: &str) -> Result<Self> {
        let mut templates = Handlebars::new();
        templates.set_strict_mode(true);
        templates
            .register_template_string(BALANCE_TEMPLATE, BALANCE_TEMPLATE_HTML)
            .map_err(Box::new)?;

        Ok(Self {
            postmark_client,
            sender: sender.to_string(),
            templates: Arc::new(templates),
        })
    }

    /// Builds the balance email for `record` without sending it.
    pub fn compose(&self, email: &str, record: &AccountRecord) -> Result<SendEmailRequest> {
        let date = Local::now().format("%B %d, %Y at %I:%M %p").to_string();
        let ny = record.ny_identity();
        let nj = record.nj_identity();

        let html_body = self.templates.render(
            BALANCE_TEMPLATE,
            &json!({
                "date": date,
                "has_ny": ny.is_some(),
                "has_nj": nj.is_some(),
                "account_number": ny.map(|id| id.account_number).unwrap_or("N/A"),
                "plate_number": ny.map(|id| id.plate_number).unwrap_or("N/A"),
                "violation_number": nj.map(|id| id.violation_number).unwrap_or("N/A"),
                "nj_plate_number": nj.map(|id| id.plate_number).unwrap_or("N/A"),
                "ny_balance_due": format_amount(record.ny_balance),
                "nj_balance_due": format_amount(record.nj_balance),
                "balance_due": format_amount(record.total_balance),
                "violation_count": record.violation_count,
                "bill_numbers": record.bill_numbers,
            }),
        )?;

        Ok(SendEmailRequest {
            from: self.sender.clone(),
            to: email.to_string(),
            subject: Some(subject(record)),
            text_body: Some(text_body(record, &date)),
            html_body: Some(html_body),
            tag: Some("toll-balance".to_string()),
            ..SendEmailRequest::default()
        })
    }

    pub async fn send_balance_notification(&self, email: &str, record: &AccountRecord) -> Result<()> {
        let request = self.compose(email, record)?;

        tracing::debug!(
            account = record.id.to_string(),
            email = mask::email(email),
            total_balance = format_amount(record.total_balance),
            "sending balance notification",
        );

        if let Err(e) = self.postmark_client.send_email(&request).await {
            tracing::error!(
                account = record.id.to_string(),
                email = mask::email(email),
                "failed to send balance notification: {}",
                e
            );
            return Err(e.into());
        }

        tracing::info!(
            account = record.id.to_string(),
            email = mask::email(email),
            "balance notification sent"
        );

        Ok(())
    }
}

#[async_trait]
impl AccountNotifier for Notifier {
    async fn notify(
        &self,
        email: &str,
        record: &AccountRecord,
    ) -> std::result::Result<(), NotificationFailure> {
        self.send_balance_notification(email, record)
            .await
            .map_err(|e| NotificationFailure::new(e.to_string()))
    }
}

/// Subject line naming the balances of the sources the account has.
pub fn subject(record: &AccountRecord) -> String {
    let total = format_amount(record.total_balance);
    match (record.ny_identity().is_some(), record.nj_identity().is_some()) {
        (true, true) => format!(
            "E-ZPass Toll Information - NY: ${} | NJ: ${} | Total: ${}",
            format_amount(record.ny_balance),
            format_amount(record.nj_balance),
            total
        ),
        (false, true) => format!("E-ZPass NJ Toll Information - Balance Due: ${}", total),
        _ => format!("E-ZPass NY Toll Information - Balance Due: ${}", total),
    }
}

fn text_body(record: &AccountRecord, date: &str) -> String {
    let mut lines = vec!["E-ZPass Toll Information\n".to_string()];

    if let Some(ny) = record.ny_identity() {
        lines.push(format!("NY Account Number: {}", ny.account_number));
        lines.push(format!("NY Plate Number: {}", ny.plate_number));
        lines.push(format!("NY Balance: ${}\n", format_amount(record.ny_balance)));
    }
    if let Some(nj) = record.nj_identity() {
        lines.push(format!("NJ Violation Number: {}", nj.violation_number));
        lines.push(format!("NJ Plate Number: {}", nj.plate_number));
        lines.push(format!("NJ Balance: ${}\n", format_amount(record.nj_balance)));
    }

    let bill_numbers = if record.bill_numbers.is_empty() {
        "None".to_string()
    } else {
        record
            .bill_numbers
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    };

    lines.push(format!(
        "Total Balance Due: ${}",
        format_amount(record.total_balance)
    ));
    lines.push(format!("Date: {}", date));
    lines.push(format!("\nBill Numbers: {}", bill_numbers));
    lines.push(format!("Violations: {}", record.violation_count));

    lines.join("\n")
}
