//! Parser for function-like channel names: `name` or `name(num, num, ...)`.

use crate::error::{PvError, PvResult};

/// A parsed `name(args...)` channel name
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCall {
    pub name: String,
    pub args: Vec<f64>,
}

fn syntax_error(input: &str) -> PvError {
    PvError::Configuration(format!(
        "Syntax error in '{}': expected a function like xxx(num1, num2, ...)",
        input
    ))
}

/// Parse `sine(0, 10, 20, 0.1)` into its name and numeric arguments.
///
/// The parentheses are optional; `flipflop` and `flipflop()` both parse to
/// an empty argument list.
pub fn parse_function(input: &str) -> PvResult<FunctionCall> {
    let input = input.trim();
    let (name, rest) = match input.find('(') {
        Some(open) => (&input[..open], Some(&input[open + 1..])),
        None => (input, None),
    };

    let name = name.trim();
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(syntax_error(input));
    }

    let args = match rest {
        None => Vec::new(),
        Some(rest) => {
            let inner = rest.strip_suffix(')').ok_or_else(|| syntax_error(input))?;
            parse_parameters(inner).map_err(|_| syntax_error(input))?
        }
    };

    Ok(FunctionCall {
        name: name.to_string(),
        args,
    })
}

/// Parse a comma separated list of numbers; an empty string gives no numbers
fn parse_parameters(list: &str) -> PvResult<Vec<f64>> {
    if list.trim().is_empty() {
        return Ok(Vec::new());
    }
    list.split(',')
        .map(|item| {
            let item = item.trim();
            item.parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .ok_or_else(|| {
                    PvError::Configuration(format!("'{}' is not a number", item))
                })
        })
        .collect()
}
