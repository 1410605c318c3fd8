//! Email address parsing and reply trimming for inbound mail

use std::fmt;

use mailparse::{addrparse, MailAddr, SingleInfo};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{ExcommsError, Result};

static ADDRESS_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^\s@<>]+@[^\s@<>.]+(\.[^\s@<>.]+)+$").unwrap());

/// A mailbox as `Name <address>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailAddress {
    pub name: String,
    pub address: String,
}

impl EmailAddress {
    pub fn domain(&self) -> &str {
        self.address.rsplit_once('@').map(|(_, d)| d).unwrap_or_default()
    }
}

impl fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.is_empty() {
            write!(f, "{}", self.address)
        } else {
            write!(f, "\"{}\" <{}>", self.name.replace('"', "'"), self.address)
        }
    }
}

/// Parse exactly one mailbox.
pub fn parse_address(raw: &str) -> Result<EmailAddress> {
    let list = addrparse(raw.trim())
        .map_err(|e| ExcommsError::invalid_argument(format!("invalid email address {:?}: {}", raw, e)))?;
    match list.extract_single_info() {
        Some(info) => mailbox(&info),
        None => Err(ExcommsError::invalid_argument(format!(
            "expected a single email address in {:?}",
            raw
        ))),
    }
}

/// Every mailbox of an address header, group members included. Entries are
/// validated one by one so a bad mailbox does not hide the rest; a header
/// that does not parse at all yields a single error.
pub fn parse_address_list(raw: &str) -> Vec<Result<EmailAddress>> {
    let list = match addrparse(raw.trim()) {
        Ok(list) => list,
        Err(e) => {
            return vec![Err(ExcommsError::invalid_argument(format!(
                "invalid address list {:?}: {}",
                raw, e
            )))];
        }
    };
    list.iter()
        .flat_map(|addr| match addr {
            MailAddr::Single(info) => vec![mailbox(info)],
            MailAddr::Group(group) => group.addrs.iter().map(mailbox).collect(),
        })
        .collect()
}

fn mailbox(info: &SingleInfo) -> Result<EmailAddress> {
    let address = info.addr.trim();
    if !ADDRESS_REGEX.is_match(address) {
        return Err(ExcommsError::invalid_argument(format!("invalid email address {:?}", address)));
    }
    Ok(EmailAddress {
        name: info.display_name.as_deref().unwrap_or_default().trim().to_string(),
        address: address.to_ascii_lowercase(),
    })
}

/// Strip quoted history and signatures from a plain-text reply.
pub fn trim_reply(body: &str) -> String {
    let body = body.replace("\r\n", "\n");
    let lines: Vec<&str> = body.lines().collect();
    let mut kept: Vec<&str> = Vec::with_capacity(lines.len());

    let mut i = 0;
    while i < lines.len() {
        let line = lines[i].trim_end();
        let trimmed = line.trim();
        if line == "--" || line == "-- " || trimmed.starts_with("-----Original Message-----") {
            break;
        }
        if trimmed.starts_with("On ") {
            // Attribution lines are often wrapped onto a second line
            let joined = match lines.get(i + 1) {
                Some(next) => format!("{} {}", trimmed, next.trim()),
                None => trimmed.to_string(),
            };
            if trimmed.ends_with("wrote:") || joined.ends_with("wrote:") {
                break;
            }
        }
        kept.push(line);
        i += 1;
    }

    while let Some(last) = kept.last() {
        let t = last.trim_start();
        if t.is_empty() || t.starts_with('>') {
            kept.pop();
        } else {
            break;
        }
    }
    kept.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_common_forms() {
        let a = parse_address("Jane Doe <Jane@Clinic.org>").unwrap();
        assert_eq!(a.name, "Jane Doe");
        assert_eq!(a.address, "jane@clinic.org");
        assert_eq!(a.domain(), "clinic.org");

        let b = parse_address("\"Doe, Jane\" <jane@clinic.org>").unwrap();
        assert_eq!(b.name, "Doe, Jane");

        let c = parse_address("jane@clinic.org").unwrap();
        assert_eq!(c.name, "");
        assert_eq!(c.to_string(), "jane@clinic.org");
    }

    #[test]
    fn rejects_malformed_addresses() {
        for raw in ["", "jane", "jane@", "@clinic.org", "jane@clinic", "jane@clinic."] {
            assert!(parse_address(raw).is_err(), "{:?} should be rejected", raw);
        }
    }

    #[test]
    fn single_address_refuses_a_list() {
        assert!(parse_address("jane@clinic.org, desk@clinic.org").is_err());
    }

    #[test]
    fn address_list_keeps_quoted_commas_together() {
        let parsed: Vec<EmailAddress> = parse_address_list("\"Smith, Jane\" <jane@clinic.org>, desk@clinic.org")
            .into_iter()
            .map(|a| a.unwrap())
            .collect();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].name, "Smith, Jane");
        assert_eq!(parsed[0].address, "jane@clinic.org");
        assert_eq!(parsed[1].address, "desk@clinic.org");
    }

    #[test]
    fn address_list_flags_bad_entries_individually() {
        let list = parse_address_list("jane@clinic, desk@clinic.org");
        assert_eq!(list.len(), 2);
        assert!(list[0].is_err());
        assert_eq!(list[1].as_ref().unwrap().address, "desk@clinic.org");
    }

    #[test]
    fn trims_quoted_history() {
        let body = "Thanks, see you Tuesday.\n\nOn Mon, Jan 1, 2024 at 9:00 AM Clinic <desk@clinic.org> wrote:\n> Your appointment is confirmed.\n";
        assert_eq!(trim_reply(body), "Thanks, see you Tuesday.");
    }

    #[test]
    fn trims_wrapped_attribution_and_signature() {
        let body = "Yes please.\r\nOn Mon, Jan 1, 2024 at 9:00 AM Clinic\r\n<desk@clinic.org> wrote:\r\n> hi";
        assert_eq!(trim_reply(body), "Yes please.");

        let signed = "Running late.\n-- \nJane\nSent from my phone";
        assert_eq!(trim_reply(signed), "Running late.");
    }

    #[test]
    fn trailing_quotes_are_dropped() {
        assert_eq!(trim_reply("ok\n\n> earlier\n> text"), "ok");
        assert_eq!(trim_reply("plain message"), "plain message");
    }
}
