use std::fmt::{Debug, Formatter};

/// Registry login, read once per build from the environment.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Credentials from optional username and password values.
    /// Both must be present and non-empty.
    pub fn from_parts(username: Option<String>, password: Option<String>) -> Option<Self> {
        match (username, password) {
            (Some(username), Some(password)) if !username.is_empty() && !password.is_empty() => {
                Some(Self::new(username, password))
            }
            _ => None,
        }
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl Debug for Credentials {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_debug_hides_password() {
        let credentials = Credentials::new("ci", "hunter2");
        let printed = format!("{credentials:?}");
        assert!(printed.contains("ci"));
        assert!(!printed.contains("hunter2"));
    }

    #[test]
    fn both_parts_are_required() {
        let credentials = Credentials::from_parts(Some("ci".into()), Some("hunter2".into())).unwrap();
        assert_eq!(credentials.username, "ci");
        assert_eq!(credentials.password(), "hunter2");

        assert!(Credentials::from_parts(Some("ci".into()), None).is_none());
        assert!(Credentials::from_parts(None, Some("hunter2".into())).is_none());
        assert!(Credentials::from_parts(Some("ci".into()), Some(String::new())).is_none());
    }
}
