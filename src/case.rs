//! Identifier case helpers: wire names are camelCase, display names are humanized.

/// Convert a single identifier from snake_case to camelCase.
/// e.g. "first_name" -> "firstName", "company_id" -> "companyId"
pub fn to_camel_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut capitalize_next = false;
    for c in s.chars() {
        if c == '_' {
            capitalize_next = true;
        } else if capitalize_next {
            out.extend(c.to_uppercase());
            capitalize_next = false;
        } else {
            out.push(c);
        }
    }
    out
}

/// Humanize a camelCase or snake_case identifier into a display name.
/// e.g. "firstName" -> "First Name", "company_id" -> "Company Id"
pub fn humanize(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 4);
    let mut at_word_start = true;
    for c in s.chars() {
        if c == '_' {
            out.push(' ');
            at_word_start = true;
        } else if at_word_start {
            out.extend(c.to_uppercase());
            at_word_start = false;
        } else if c.is_uppercase() {
            out.push(' ');
            out.push(c);
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn camel_case_from_snake() {
        assert_eq!(to_camel_case("first_name"), "firstName");
        assert_eq!(to_camel_case("company_id"), "companyId");
        assert_eq!(to_camel_case("name"), "name");
    }

    #[test]
    fn humanize_identifiers() {
        assert_eq!(humanize("firstName"), "First Name");
        assert_eq!(humanize("name"), "Name");
        assert_eq!(humanize("company_id"), "Company Id");
    }
}
