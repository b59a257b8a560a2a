use crate::session::Row;

pub const NAME_TOKEN: &str = "[name]";
pub const EMAIL_TOKEN: &str = "[email]";
pub const COMPANY_TOKEN: &str = "[company]";
/// Placeholder filled with the generated personalization sentence
pub const INSERT_TOKEN: &str = "[insert specific info]";

/// Substitute every placeholder in `template` with the row's data.
///
/// `[insert specific info]` becomes `row.personalized`, which is empty until
/// personalization has run for the row.
pub fn resolve(template: &str, row: &Row) -> String {
    resolve_fields(template, row).replace(INSERT_TOKEN, &row.personalized)
}

/// Substitute only `[name]`, `[email]` and `[company]`, leaving the insert
/// placeholder untouched.
pub fn resolve_fields(template: &str, row: &Row) -> String {
    template
        .replace(NAME_TOKEN, &row.name)
        .replace(EMAIL_TOKEN, &row.email)
        .replace(COMPANY_TOKEN, &row.company)
}

pub fn contains_insert(template: &str) -> bool {
    template.contains(INSERT_TOKEN)
}

/// Text before and after the first insert placeholder, if there is one.
pub fn split_at_insert(template: &str) -> Option<(&str, &str)> {
    template
        .find(INSERT_TOKEN)
        .map(|at| (&template[..at], &template[at + INSERT_TOKEN.len()..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> Row {
        Row {
            name: "Al".to_string(),
            email: "a@x.com".to_string(),
            company: "Acme".to_string(),
            ..Row::default()
        }
    }

    #[test]
    fn replaces_every_occurrence() {
        let resolved = resolve("[name] at [company], [name] <[email]>", &row());
        assert_eq!(resolved, "Al at Acme, Al <a@x.com>");
    }

    #[test]
    fn missing_fields_become_empty() {
        let resolved = resolve("Hi [name]!", &Row::default());
        assert_eq!(resolved, "Hi !");
    }

    #[test]
    fn insert_token_uses_personalized_text() {
        let mut row = row();
        assert_eq!(resolve("Hello [insert specific info] end", &row), "Hello  end");

        row.personalized = "great fit.".to_string();
        assert_eq!(
            resolve("Hello [insert specific info] end", &row),
            "Hello great fit. end"
        );
    }

    #[test]
    fn resolve_fields_keeps_insert_token() {
        let resolved = resolve_fields("[name]: [insert specific info]", &row());
        assert_eq!(resolved, "Al: [insert specific info]");
    }

    #[test]
    fn split_at_first_insert() {
        let (before, after) = split_at_insert("Dear [name], [insert specific info] Thanks").unwrap();
        assert_eq!(before, "Dear [name], ");
        assert_eq!(after, " Thanks");
        assert!(split_at_insert("no token here").is_none());
    }
}
