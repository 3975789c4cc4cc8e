//! Name, address and port template rendering.
//!
//! Channel names substitute `%name`, `%number`, `%lcn` and `%2lcn`.
//! Addresses and ports substitute `%number`, `%card`, `%tuner`,
//! `%server`, `%sid`, `%sid_hi` and `%sid_lo`; after substitution every
//! dotted octet of an IPv4 template, and the whole of a port template,
//! may be an integer expression over `+ - * /` (usual precedence,
//! left-to-right within a level), e.g. `239.100.%card.%number` or
//! `8000 +%number`.

use crate::error::{FanError, Result};
use std::net::{Ipv4Addr, Ipv6Addr};

/// Values available to address and port templates.
#[derive(Debug, Clone, Copy)]
pub struct TemplateVars {
    /// Channel number (1-based).
    pub number: usize,
    /// DVB adapter number.
    pub card: u32,
    /// Tuner number on the adapter.
    pub tuner: u32,
    /// Server id, for multi-instance deployments.
    pub server_id: u32,
    /// Service id of the channel.
    pub sid: u16,
}

fn substitute_vars(template: &str, vars: TemplateVars, sid_hex: bool) -> String {
    let mut out = template.to_string();
    out = out.replace("%number", &vars.number.to_string());
    out = out.replace("%card", &vars.card.to_string());
    out = out.replace("%tuner", &vars.tuner.to_string());
    out = out.replace("%server", &vars.server_id.to_string());
    // Longer tokens first so %sid does not eat %sid_hi / %sid_lo.
    out = out.replace("%sid_hi", &(vars.sid >> 8).to_string());
    out = out.replace("%sid_lo", &(vars.sid & 0xFF).to_string());
    if sid_hex {
        out = out.replace("%sid", &format!("{:04x}", vars.sid));
    } else {
        out = out.replace("%sid", &vars.sid.to_string());
    }
    out
}

/// Renders a channel name from the name template. `%lcn`/`%2lcn` stay in
/// place until the NIT is read; see [`stamp_lcn`].
pub fn render_channel_name(template: &str, service_name: &str, number_1based: usize) -> String {
    if template.is_empty() {
        return service_name.to_string();
    }
    template
        .replace("%name", service_name)
        .replace("%number", &number_1based.to_string())
}

/// Substitutes the logical channel number into a rendered channel name.
/// `%lcn` becomes a 3-digit number, `%2lcn` a 2-digit one; both become
/// empty when the LCN is unknown.
pub fn stamp_lcn(name: &str, lcn: Option<u16>) -> String {
    match lcn {
        Some(lcn) => name
            .replace("%2lcn", &format!("{lcn:02}"))
            .replace("%lcn", &format!("{lcn:03}")),
        None => name.replace("%2lcn", "").replace("%lcn", ""),
    }
}

/// Renders an IPv4 multicast address template.
pub fn render_ipv4(template: &str, vars: TemplateVars) -> Result<Ipv4Addr> {
    let substituted = substitute_vars(template, vars, false);
    let octets: Vec<&str> = substituted.split('.').collect();
    if octets.len() != 4 {
        return Err(FanError::Template(format!(
            "IPv4 template \"{substituted}\" does not have 4 octets"
        )));
    }
    let mut parts = [0u8; 4];
    for (slot, expr) in parts.iter_mut().zip(&octets) {
        let value = eval(expr)?;
        if !(0..=255).contains(&value) {
            return Err(FanError::Template(format!(
                "octet \"{expr}\" evaluates to {value}, out of range"
            )));
        }
        *slot = value as u8;
    }
    Ok(Ipv4Addr::new(parts[0], parts[1], parts[2], parts[3]))
}

/// Renders an IPv6 multicast address template. `%sid` renders as 4-digit
/// hex so it can stand alone as a group.
pub fn render_ipv6(template: &str, vars: TemplateVars) -> Result<Ipv6Addr> {
    let substituted = substitute_vars(template, vars, true);
    substituted
        .parse()
        .map_err(|_| FanError::Template(format!("bad IPv6 template result \"{substituted}\"")))
}

/// Renders a port template. Port 0 is allowed and means "let the
/// operating system pick" for listening sockets.
pub fn render_port(template: &str, vars: TemplateVars) -> Result<u16> {
    let substituted = substitute_vars(template, vars, false);
    let value = eval(&substituted)?;
    if !(0..=65535).contains(&value) {
        return Err(FanError::Template(format!(
            "port \"{substituted}\" evaluates to {value}, out of range"
        )));
    }
    Ok(value as u16)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token {
    Number(i64),
    Op(char),
}

fn tokenize(expr: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = expr.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' => {
                chars.next();
            }
            '0'..='9' => {
                let mut value: i64 = 0;
                while let Some(d) = chars.peek().and_then(|c| c.to_digit(10)) {
                    value = value
                        .checked_mul(10)
                        .and_then(|v| v.checked_add(i64::from(d)))
                        .ok_or_else(|| {
                            FanError::Template(format!("integer overflow in \"{expr}\""))
                        })?;
                    chars.next();
                }
                tokens.push(Token::Number(value));
            }
            '+' | '-' | '*' | '/' => {
                tokens.push(Token::Op(c));
                chars.next();
            }
            other => {
                return Err(FanError::Template(format!(
                    "unexpected character '{other}' in \"{expr}\""
                )));
            }
        }
    }
    Ok(tokens)
}

/// Evaluates an integer expression over non-negative literals with
/// `+ - * /`, `*` and `/` binding tighter, left-to-right within a level.
pub fn eval(expr: &str) -> Result<i64> {
    let tokens = tokenize(expr)?;

    // Fold multiplicative operators first.
    let mut terms: Vec<Token> = Vec::new();
    let mut iter = tokens.into_iter();
    loop {
        match iter.next() {
            Some(Token::Number(n)) => match terms.last().copied() {
                Some(Token::Op(op)) if op == '*' || op == '/' => {
                    terms.pop();
                    let Some(Token::Number(acc)) = terms.pop() else {
                        return Err(FanError::Template(format!("misplaced operator in \"{expr}\"")));
                    };
                    let folded = if op == '*' {
                        acc.checked_mul(n)
                            .ok_or_else(|| FanError::Template(format!("overflow in \"{expr}\"")))?
                    } else if n == 0 {
                        return Err(FanError::Template(format!("division by zero in \"{expr}\"")));
                    } else {
                        acc / n
                    };
                    terms.push(Token::Number(folded));
                }
                Some(Token::Number(_)) => {
                    return Err(FanError::Template(format!(
                        "two numbers without operator in \"{expr}\""
                    )));
                }
                _ => terms.push(Token::Number(n)),
            },
            Some(Token::Op(op)) => {
                if !matches!(terms.last(), Some(Token::Number(_))) {
                    return Err(FanError::Template(format!("misplaced operator in \"{expr}\"")));
                }
                terms.push(Token::Op(op));
            }
            None => break,
        }
    }

    // Then fold the additive level left-to-right.
    let mut iter = terms.into_iter();
    let mut acc = match iter.next() {
        Some(Token::Number(n)) => n,
        _ => return Err(FanError::Template(format!("empty expression \"{expr}\""))),
    };
    while let Some(token) = iter.next() {
        let Token::Op(op) = token else {
            return Err(FanError::Template(format!("malformed expression \"{expr}\"")));
        };
        let Some(Token::Number(rhs)) = iter.next() else {
            return Err(FanError::Template(format!("trailing operator in \"{expr}\"")));
        };
        acc = match op {
            '+' => acc
                .checked_add(rhs)
                .ok_or_else(|| FanError::Template(format!("overflow in \"{expr}\"")))?,
            '-' => acc - rhs,
            _ => unreachable!("multiplicative operators folded above"),
        };
    }
    Ok(acc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    fn vars() -> TemplateVars {
        TemplateVars {
            number: 0,
            card: 0,
            tuner: 0,
            server_id: 0,
            sid: 100,
        }
    }

    #[test]
    fn test_eval_basics() {
        assert_eq!(eval("42").unwrap(), 42);
        assert_eq!(eval("1+2*3").unwrap(), 7);
        assert_eq!(eval("10-2-3").unwrap(), 5);
        assert_eq!(eval("8000 +2").unwrap(), 8002);
        assert_eq!(eval("130+0*10+2").unwrap(), 132);
    }

    #[test]
    fn test_eval_rejects_garbage() {
        assert!(eval("").is_err());
        assert!(eval("1+").is_err());
        assert!(eval("*2").is_err());
        assert!(eval("1/0").is_err());
        assert!(eval("abc").is_err());
    }

    #[test]
    fn test_octet_split_law() {
        // "239.100+0.1+0.1" splits per octet, then each evaluates
        let rendered = render_ipv4("239.100+0.1+0.1", vars()).unwrap();
        assert_eq!(rendered, Ipv4Addr::new(239, 100, 1, 1));
    }

    #[test]
    fn test_render_ipv4_default_template() {
        let mut v = vars();
        v.number = 1;
        assert_eq!(
            render_ipv4("239.100.%card.%number", v).unwrap(),
            Ipv4Addr::new(239, 100, 0, 1)
        );
    }

    #[test]
    fn test_render_ipv4_out_of_range() {
        let mut v = vars();
        v.number = 300;
        assert!(render_ipv4("239.100.%card.%number", v).is_err());
        assert!(render_ipv4("239.100.0", v).is_err());
    }

    #[test]
    fn test_render_ipv6_sid_hex() {
        let mut v = vars();
        v.sid = 0x1234;
        let addr = render_ipv6("FF15:4242::%server:%card:%sid", v).unwrap();
        assert_eq!(addr.segments()[7], 0x1234);
    }

    #[test]
    fn test_render_port_with_expression() {
        let mut v = vars();
        v.number = 3;
        assert_eq!(render_port("8000 +%number", v).unwrap(), 8003);
        assert_eq!(render_port("0", v).unwrap(), 0);
        assert!(render_port("70000", v).is_err());
    }

    #[test]
    fn test_sid_tokens_do_not_collide() {
        let mut v = vars();
        v.sid = 0x0102;
        assert_eq!(
            render_port("%sid_hi*256+%sid_lo", v).unwrap(),
            0x0102u16
        );
    }

    #[test]
    fn test_render_channel_name() {
        assert_eq!(render_channel_name("", "TV One", 1), "TV One");
        assert_eq!(
            render_channel_name("%number - %name", "TV One", 2),
            "2 - TV One"
        );
    }

    #[test]
    fn test_stamp_lcn() {
        assert_eq!(stamp_lcn("%lcn - A", Some(5)), "005 - A");
        assert_eq!(stamp_lcn("%2lcn - A", Some(5)), "05 - A");
        assert_eq!(stamp_lcn("%lcn - B", None), " - B");
    }

    #[test]
    fn test_substitution_idempotent_once_resolved() {
        let rendered = render_channel_name("%number - %name", "A", 1);
        assert_eq!(render_channel_name(&rendered, "ignored", 9), rendered);
    }

    #[quickcheck]
    fn prop_eval_literal_is_identity(n: u32) -> bool {
        eval(&n.to_string()).unwrap() == i64::from(n)
    }

    #[quickcheck]
    fn prop_eval_addition_matches(a: u16, b: u16) -> bool {
        eval(&format!("{a}+{b}")).unwrap() == i64::from(a) + i64::from(b)
    }

    #[quickcheck]
    fn prop_eval_precedence(a: u8, b: u8, c: u8) -> bool {
        eval(&format!("{a}+{b}*{c}")).unwrap() == i64::from(a) + i64::from(b) * i64::from(c)
    }
}
