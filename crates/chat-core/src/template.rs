//! Welcome-message template resolution.
//!
//! Placeholders look like `{{scope.key}}` or `{{scope.key|fallback}}`:
//!
//! - `customer.firstName`, `customer.lastName`, `customer.fullName`
//! - `customer.customFields.<id>`
//! - `contact.customFields.<id>`
//!
//! A placeholder that cannot be resolved uses its fallback when one is given
//! and is otherwise left in the output verbatim.

use std::sync::LazyLock;

use regex::{Captures, Regex};

use crate::types::{CustomField, CustomerIdentity};

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([^{}|]+?)\s*(?:\|([^{}]*))?\}\}").expect("placeholder regex is valid")
});

/// Data available when a template is resolved.
#[derive(Debug, Clone, Copy)]
pub struct TemplateContext<'a> {
    pub customer: &'a CustomerIdentity,
    pub customer_fields: &'a [CustomField],
    pub contact_fields: &'a [CustomField],
}

impl TemplateContext<'_> {
    fn lookup(&self, key: &str) -> Option<String> {
        let value = match key.split('.').collect::<Vec<_>>().as_slice() {
            ["customer", "firstName"] => self.customer.first_name.clone(),
            ["customer", "lastName"] => self.customer.last_name.clone(),
            ["customer", "fullName"] => self.customer.full_name(),
            ["customer", "customFields", id] => field_value(self.customer_fields, id),
            ["contact", "customFields", id] => field_value(self.contact_fields, id),
            _ => None,
        };
        value.filter(|value| !value.trim().is_empty())
    }
}

fn field_value(fields: &[CustomField], id: &str) -> Option<String> {
    fields
        .iter()
        .find(|field| field.id == id)
        .map(|field| field.value.clone())
}

/// Substitute every placeholder in `template`.
pub fn resolve_template(template: &str, context: &TemplateContext<'_>) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures<'_>| {
            let key = caps.get(1).map_or("", |m| m.as_str());
            context
                .lookup(key)
                .or_else(|| caps.get(2).map(|fallback| fallback.as_str().to_owned()))
                .unwrap_or_else(|| caps[0].to_owned())
        })
        .into_owned()
}
