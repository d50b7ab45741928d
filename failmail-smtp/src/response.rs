//! SMTP reply parsing for the client side of a relay transaction.

/// A complete (possibly multi-line) SMTP reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Response {
    /// Try to parse one complete reply from the front of `buffer`, returning
    /// the reply and the number of bytes consumed. `None` means more data is
    /// needed.
    pub(crate) fn parse(buffer: &[u8]) -> Result<Option<(Self, usize)>, String> {
        let mut lines = Vec::new();
        let mut code = None;
        let mut offset = 0;

        loop {
            let rest = &buffer[offset..];
            let Some(end) = rest.iter().position(|&b| b == b'\n') else {
                return Ok(None);
            };

            let mut line = &rest[..end];
            if line.last() == Some(&b'\r') {
                line = &line[..line.len() - 1];
            }
            offset += end + 1;

            let line = std::str::from_utf8(line)
                .map_err(|_| "reply is not valid UTF-8".to_string())?;
            if line.len() < 3 {
                return Err(format!("short reply line: {line:?}"));
            }

            let this_code: u16 = line[..3]
                .parse()
                .map_err(|_| format!("malformed reply code in {line:?}"))?;
            if *code.get_or_insert(this_code) != this_code {
                return Err(format!("reply code changed mid-reply in {line:?}"));
            }

            let separator = line.as_bytes().get(3).copied();
            lines.push(line.get(4..).unwrap_or("").to_string());

            match separator {
                Some(b'-') => {}
                None | Some(b' ') => {
                    return Ok(code.map(|code| (Self { code, lines }, offset)));
                }
                Some(other) => {
                    return Err(format!("unexpected reply separator {:?}", other as char));
                }
            }
        }
    }

    /// 2xx replies.
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// 3xx replies (e.g. 354 after DATA).
    #[must_use]
    pub fn is_intermediate(&self) -> bool {
        (300..400).contains(&self.code)
    }

    /// Whether an EHLO reply advertises the named extension.
    #[must_use]
    pub fn advertises(&self, extension: &str) -> bool {
        self.lines
            .iter()
            .any(|line| line.eq_ignore_ascii_case(extension) || {
                line.len() > extension.len()
                    && line[..extension.len()].eq_ignore_ascii_case(extension)
                    && line.as_bytes()[extension.len()] == b' '
            })
    }

    #[must_use]
    pub fn message(&self) -> String {
        self.lines.join(" ")
    }
}
