use std::ops::Range;

const ON_CONFLICT_DO_NOTHING: &str = "ON CONFLICT DO NOTHING";

/// Rewrite positional `?` placeholders to `$1, $2, ...`, leaving any `?` inside
/// single- or double-quoted text untouched.
#[must_use]
pub fn rewrite_params(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len() + 8);
    let mut index = 0_usize;
    let mut in_single = false;
    let mut in_double = false;

    for ch in sql.chars() {
        match ch {
            '\'' if !in_double => {
                in_single = !in_single;
                out.push(ch);
            }
            '"' if !in_single => {
                in_double = !in_double;
                out.push(ch);
            }
            '?' if !in_single && !in_double => {
                index += 1;
                out.push('$');
                out.push_str(&index.to_string());
            }
            _ => out.push(ch),
        }
    }

    out
}

/// Translate a portable statement into the Postgres dialect.
///
/// `INSERT OR IGNORE` becomes a plain `INSERT` with `ON CONFLICT DO NOTHING`
/// appended (before any `RETURNING` clause). Statements without the idiom only
/// get their placeholders renumbered.
#[must_use]
pub fn translate_sql(sql: &str) -> String {
    let rewritten = rewrite_params(sql);
    let Some(idiom) = find_insert_or_ignore(&rewritten) else {
        return rewritten;
    };

    let mut statement = String::with_capacity(rewritten.len() + ON_CONFLICT_DO_NOTHING.len() + 1);
    statement.push_str(&rewritten[..idiom.start]);
    statement.push_str("INSERT");
    statement.push_str(&rewritten[idiom.end..]);
    append_on_conflict(&statement)
}

fn append_on_conflict(statement: &str) -> String {
    let body = statement.trim_end();
    let (body, terminator) = match body.strip_suffix(';') {
        Some(stripped) => (stripped.trim_end(), ";"),
        None => (body, ""),
    };

    let returning = words_outside_quotes(body)
        .into_iter()
        .rev()
        .find(|word| body[word.clone()].eq_ignore_ascii_case("RETURNING"));

    match returning {
        Some(word) => format!(
            "{} {ON_CONFLICT_DO_NOTHING} {}{terminator}",
            body[..word.start].trim_end(),
            &body[word.start..]
        ),
        None => format!("{body} {ON_CONFLICT_DO_NOTHING}{terminator}"),
    }
}

fn find_insert_or_ignore(sql: &str) -> Option<Range<usize>> {
    let words = words_outside_quotes(sql);
    words.windows(3).find_map(|window| {
        let [insert, or, ignore] = window else {
            return None;
        };
        let matches = sql[insert.clone()].eq_ignore_ascii_case("INSERT")
            && sql[or.clone()].eq_ignore_ascii_case("OR")
            && sql[ignore.clone()].eq_ignore_ascii_case("IGNORE")
            && sql[insert.end..or.start].trim().is_empty()
            && sql[or.end..ignore.start].trim().is_empty();
        matches.then_some(insert.start..ignore.end)
    })
}

/// Byte ranges of identifier-like words that are not inside quoted text.
fn words_outside_quotes(sql: &str) -> Vec<Range<usize>> {
    let mut words = Vec::new();
    let mut start: Option<usize> = None;
    let mut in_single = false;
    let mut in_double = false;

    for (idx, ch) in sql.char_indices() {
        let quoted = in_single || in_double;
        if !quoted && (ch.is_ascii_alphanumeric() || ch == '_') {
            start.get_or_insert(idx);
            continue;
        }
        if let Some(begin) = start.take() {
            words.push(begin..idx);
        }
        match ch {
            '\'' if !in_double => in_single = !in_single,
            '"' if !in_single => in_double = !in_double,
            _ => {}
        }
    }
    if let Some(begin) = start {
        words.push(begin..sql.len());
    }

    words
}
