//! Environment variable helpers with platform-specific name rules.

/// Whether `name` can be set or removed safely.
///
/// Empty names and names containing `=` or NUL are rejected by every
/// platform; `std::env::remove_var` panics on them.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && !name.contains('=') && !name.contains('\0')
}

/// Whether a variable is set, comparing names the way the platform does.
///
/// # Platform Behavior
/// - **Windows**: Case-insensitive (e.g., `%USERNAME%` == `%username%`)
/// - **Linux/macOS**: Case-sensitive (e.g., `$USER` != `$user`)
pub fn is_set(name: &str) -> bool {
    #[cfg(windows)]
    {
        std::env::vars_os().any(|(k, _)| k.to_string_lossy().eq_ignore_ascii_case(name))
    }

    #[cfg(not(windows))]
    {
        std::env::var_os(name).is_some()
    }
}

/// Remove a variable from this process's environment. Returns whether it
/// was present.
pub fn remove(name: &str) -> bool {
    let present = is_set(name);
    if present {
        std::env::remove_var(name);
    }
    present
}
