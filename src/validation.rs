use std::ops::RangeInclusive;

/// Characters rejected in sample and target names.
pub const ILLEGAL_NAME_CHARS: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|', '\n', '\r'];

const RESERVED_NAMES: &[&str] = &["CON", "PRN", "AUX", "NUL"];

/// Validates that a sample or target name can be used as a directory name
/// on every platform the acquisition server may run on.
///
/// # Arguments
///
/// * `name` - The name to validate.
///
/// # Returns
///
/// * `Ok(())` if the name is usable.
/// * `Err(&'static str)` describing the first problem found.
pub fn is_valid_name(name: &str) -> Result<(), &'static str> {
    if name.trim().is_empty() {
        return Err("Name cannot be empty");
    }
    if name.starts_with(' ') || name.ends_with(' ') {
        return Err("Name cannot start or end with a space");
    }
    if name.starts_with('.') || name.ends_with('.') {
        return Err("Name cannot start or end with a period");
    }
    if name.contains(ILLEGAL_NAME_CHARS) {
        return Err("Name contains a character that is not allowed in file names");
    }
    if is_reserved_name(name) {
        return Err("Name is reserved by the operating system");
    }
    Ok(())
}

/// Whether `name` is a reserved device name, with or without an extension.
pub fn is_reserved_name(name: &str) -> bool {
    let stem = name.split('.').next().unwrap_or(name).to_ascii_uppercase();
    if RESERVED_NAMES.contains(&stem.as_str()) {
        return true;
    }
    ["COM", "LPT"].iter().any(|prefix| {
        stem.strip_prefix(prefix)
            .map(|digit| matches!(digit, "1" | "2" | "3" | "4" | "5" | "6" | "7" | "8" | "9"))
            .unwrap_or(false)
    })
}

/// Replace characters that are not allowed in names with underscores.
pub fn sanitize_name(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| if ILLEGAL_NAME_CHARS.contains(&c) { '_' } else { c })
        .collect();
    let trimmed = replaced.trim_matches(|c: char| c == ' ' || c == '.');
    if trimmed.is_empty() {
        "unnamed".to_string()
    } else if is_reserved_name(trimmed) {
        format!("{trimmed}_")
    } else {
        trimmed.to_string()
    }
}

/// Validates if a given value is within a specified numeric range.
pub fn is_in_range<T: PartialOrd>(value: T, range: RangeInclusive<T>) -> Result<(), &'static str> {
    if range.contains(&value) {
        Ok(())
    } else {
        Err("Value is outside the specified range")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_names() {
        assert!(is_valid_name("slide_01").is_ok());
        assert!(is_valid_name("Tissue 3 (left)").is_ok());
        assert!(is_valid_name("COM10").is_ok());
        assert!(is_valid_name("console").is_ok());
    }

    #[test]
    fn test_invalid_names() {
        assert!(is_valid_name("").is_err());
        assert!(is_valid_name("   ").is_err());
        assert!(is_valid_name(" lead").is_err());
        assert!(is_valid_name("trail.").is_err());
        assert!(is_valid_name("a/b").is_err());
        assert!(is_valid_name("a:b").is_err());
        assert!(is_valid_name("two\nlines").is_err());
    }

    #[test]
    fn test_reserved_names() {
        assert!(is_reserved_name("CON"));
        assert!(is_reserved_name("nul.txt"));
        assert!(is_reserved_name("com3"));
        assert!(is_reserved_name("LPT9.tif"));
        assert!(!is_reserved_name("LPT0"));
        assert!(is_valid_name("aux").is_err());
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("a/b:c"), "a_b_c");
        assert_eq!(sanitize_name(" .hidden. "), "hidden");
        assert_eq!(sanitize_name("CON"), "CON_");
        assert_eq!(sanitize_name("..."), "unnamed");
    }

    #[test]
    fn test_is_in_range() {
        assert!(is_in_range(5, 1..=10).is_ok());
        assert!(is_in_range(-21000.0, -21000.0..=33000.0).is_ok());
        assert!(is_in_range(11, 1..=10).is_err());
    }
}
