/// Project names must be non-empty ASCII, starting with a letter, remainder alphanumeric.
pub fn validate_project_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !first.is_ascii_alphabetic() {
        return false;
    }
    chars.all(|c| c.is_ascii_alphanumeric())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_alnum_starting_with_letter() {
        assert!(validate_project_name("ok1"));
        assert!(validate_project_name("abc"));
    }

    #[test]
    fn rejects_empty() {
        assert!(!validate_project_name(""));
    }

    #[test]
    fn rejects_leading_digit() {
        assert!(!validate_project_name("1abc"));
    }

    #[test]
    fn rejects_punctuation() {
        assert!(!validate_project_name("a;"));
    }
}
