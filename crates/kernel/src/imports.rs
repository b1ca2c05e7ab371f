/// Top-level module names imported by `code`, in first-seen order.
///
/// Handles `import a.b as c, d` and `from a.b import c`, at any
/// indentation and separated by `;`. Relative imports and anything inside a
/// triple-quoted string are skipped.
pub fn find_imports(code: &str) -> Vec<String> {
    let mut modules: Vec<String> = Vec::new();
    let mut open_quote: Option<&str> = None;

    for line in code.lines() {
        let was_inside = open_quote.is_some();
        for quote in [r#"""""#, "'''"] {
            if open_quote.is_some_and(|q| q != quote) {
                continue;
            }
            if line.matches(quote).count() % 2 == 1 {
                open_quote = match open_quote {
                    Some(_) => None,
                    None => Some(quote),
                };
            }
        }
        if was_inside || open_quote.is_some() {
            continue;
        }

        for statement in statements(line) {
            for module in statement_imports(statement.trim()) {
                if !modules.iter().any(|m| m == module) {
                    modules.push(module.to_string());
                }
            }
        }
    }

    modules
}

/// Splits a line at `;` and drops a trailing `#` comment, ignoring both
/// inside string literals.
fn statements(line: &str) -> Vec<&str> {
    let mut statements = Vec::new();
    let mut start = 0;
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for (i, c) in line.char_indices() {
        match quote {
            Some(_) if escaped => escaped = false,
            Some(_) if c == '\\' => escaped = true,
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None => match c {
                '\'' | '"' => quote = Some(c),
                ';' => {
                    statements.push(&line[start..i]);
                    start = i + 1;
                }
                '#' => {
                    statements.push(&line[start..i]);
                    return statements;
                }
                _ => {}
            },
        }
    }
    statements.push(&line[start..]);

    statements
}

fn keyword<'a>(statement: &'a str, word: &str) -> Option<&'a str> {
    statement
        .strip_prefix(word)
        .filter(|rest| rest.starts_with(char::is_whitespace))
}

fn statement_imports(statement: &str) -> Vec<&str> {
    if let Some(rest) = keyword(statement, "import") {
        rest.split(',')
            .filter_map(|clause| clause.split_whitespace().next())
            .filter_map(top_level)
            .collect()
    } else if let Some(rest) = keyword(statement, "from") {
        let mut words = rest.split_whitespace();
        match (words.next(), words.next()) {
            (Some(module), Some("import")) => top_level(module).into_iter().collect(),
            _ => Vec::new(),
        }
    } else {
        Vec::new()
    }
}

fn top_level(dotted: &str) -> Option<&str> {
    let name = dotted.split('.').next()?;
    let mut chars = name.chars();
    let first = chars.next()?;
    let valid = (first.is_alphabetic() || first == '_')
        && chars.all(|c| c.is_alphanumeric() || c == '_');

    valid.then_some(name)
}
