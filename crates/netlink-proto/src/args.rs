//! RFC1459-style argument tokenization.
//!
//! S2S lines are split on single spaces; a token beginning with `:`
//! anywhere after the first position starts the trailing argument,
//! which swallows the rest of the line with the colon stripped.
//! Empty tokens from doubled spaces are preserved so dialect modules
//! can normalize ircd-specific whitespace quirks themselves.

/// Split a raw line into its argument vector.
///
/// The first token is never treated as a trailing argument, so sender
/// prefixes (`:42X`) pass through untouched.
pub fn parse_args(line: &str) -> Vec<String> {
    let tokens: Vec<&str> = line.split(' ').collect();

    let mut real_args = Vec::with_capacity(tokens.len());
    for (idx, tok) in tokens.iter().enumerate() {
        if idx != 0 && tok.starts_with(':') {
            let joined = tokens[idx..].join(" ");
            real_args.push(joined[1..].to_string());
            break;
        }
        real_args.push(tok.to_string());
    }

    real_args
}

/// Like [`parse_args`], but also strips a leading `:` from the first
/// argument. Used where the sender prefix is guaranteed present.
pub fn parse_prefixed_args(line: &str) -> Vec<String> {
    let mut args = parse_args(line);
    if let Some(first) = args.first_mut() {
        if let Some(stripped) = first.strip_prefix(':') {
            *first = stripped.to_string();
        }
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_simple_line() {
        let args = parse_args("PING 42X");
        assert_eq!(args, vec!["PING", "42X"]);
    }

    #[test]
    fn trailing_argument_swallows_rest() {
        let args = parse_args(":70MAAAAAA PRIVMSG #dev :hello there world");
        assert_eq!(
            args,
            vec![":70MAAAAAA", "PRIVMSG", "#dev", "hello there world"]
        );
    }

    #[test]
    fn first_token_colon_is_not_trailing() {
        let args = parse_args(":server.name SQUIT leaf.name :gone");
        assert_eq!(args[0], ":server.name");
        assert_eq!(args[3], "gone");
    }

    #[test]
    fn trailing_argument_may_be_empty() {
        let args = parse_args(":1SRAAGB4T QUIT :");
        assert_eq!(args, vec![":1SRAAGB4T", "QUIT", ""]);
    }

    #[test]
    fn colon_inside_trailing_is_kept() {
        let args = parse_args("PASS :abc:def ghi");
        assert_eq!(args, vec!["PASS", "abc:def ghi"]);
    }

    #[test]
    fn doubled_spaces_are_preserved_as_empty_tokens() {
        // UnrealIRCd emits stray double spaces after +f arguments.
        let args = parse_args(":unreal.midnight.vpn MODE #test +f 5  GL");
        assert_eq!(args, vec![":unreal.midnight.vpn", "MODE", "#test", "+f", "5", "", "GL"]);
    }

    #[test]
    fn prefixed_args_strips_sender_colon() {
        let args = parse_prefixed_args(":001 UID GL 0 1441306929 gl localhost");
        assert_eq!(args[0], "001");
        assert_eq!(args[1], "UID");
    }
}
