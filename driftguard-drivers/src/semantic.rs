//! Compile [`SemanticQuery`] descriptions into XPath expressions.
//!
//! WebDriver has no native accessibility-tree lookup, so roles are mapped to
//! an explicit `@role` or their implicit native elements, and labels follow
//! `<label for>`, wrapping labels, `aria-label` and `aria-labelledby`.
use crate::page::SemanticQuery;

/// Quote `s` as an XPath 1.0 string literal.
pub fn xpath_literal(s: &str) -> String {
    if !s.contains('\'') {
        return format!("'{s}'");
    }
    if !s.contains('"') {
        return format!("\"{s}\"");
    }
    let parts: Vec<String> = s.split('\'').map(|p| format!("'{p}'")).collect();
    format!("concat({})", parts.join(", \"'\", "))
}

fn implicit_role(role: &str) -> Option<&'static str> {
    let pred = match role {
        "button" => {
            "self::button or (self::input and (@type='button' or @type='submit' or @type='reset'))"
        }
        "link" => "self::a[@href]",
        "textbox" => {
            "self::textarea or (self::input and (not(@type) or @type='text' or @type='email' \
             or @type='password' or @type='search' or @type='tel' or @type='url'))"
        }
        "checkbox" => "self::input[@type='checkbox']",
        "radio" => "self::input[@type='radio']",
        "combobox" | "listbox" => "self::select",
        "heading" => "self::h1 or self::h2 or self::h3 or self::h4 or self::h5 or self::h6",
        "option" => "self::option",
        _ => return None,
    };
    Some(pred)
}

fn role_predicate(role: &str) -> String {
    let lit = xpath_literal(role);
    match implicit_role(role) {
        Some(native) => format!("(@role={lit} or (not(@role) and ({native})))"),
        None => format!("@role={lit}"),
    }
}

fn label_predicate(label: &str) -> String {
    let lit = xpath_literal(label);
    format!(
        "(@aria-label={lit} or @id=//label[normalize-space(.)={lit}]/@for \
         or ancestor::label[normalize-space(.)={lit}] \
         or @aria-labelledby=//*[normalize-space(.)={lit}]/@id)"
    )
}

/// Build an XPath for `query`, or `None` when the query is empty.
pub fn to_xpath(query: &SemanticQuery) -> Option<String> {
    let mut predicates = Vec::new();

    if let Some(role) = query.role.as_deref() {
        predicates.push(role_predicate(role));
    }
    if let Some(label) = query.label.as_deref() {
        predicates.push(label_predicate(label));
    }
    if let Some(text) = query.text.as_deref() {
        let lit = xpath_literal(text);
        predicates.push(format!("normalize-space(.)={lit}"));
        if query.role.is_none() {
            // deepest match only, not every ancestor sharing the text
            predicates.push(format!("not(.//*[normalize-space(.)={lit}])"));
        }
    }
    if let Some(placeholder) = query.placeholder.as_deref() {
        predicates.push(format!("@placeholder={}", xpath_literal(placeholder)));
    }

    if predicates.is_empty() {
        None
    } else {
        Some(format!("//*[{}]", predicates.join(" and ")))
    }
}
