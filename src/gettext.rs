/// gettext package
pub(crate) const GETTEXT_PACKAGE: &str = "storaged";

/// Translate `msgid` to a localized message from the storaged domain.
///
/// Used for the messages shown in authentication dialogs; falls back to
/// `msgid` itself when no catalog is installed.
pub(crate) fn gettext<T>(msgid: T) -> String
where
    T: Into<String>,
{
    gettextrs::dgettext(GETTEXT_PACKAGE, msgid.into())
}
