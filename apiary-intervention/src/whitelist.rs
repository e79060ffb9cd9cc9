//! The intervention command whitelist
//!
//! While an operator drives, only a narrow set of commands may execute:
//! - `Navigate`, `Type`, `Click`, `WaitForElement`
//! - `ExecuteScript`, only with `parameters.safe == true`
//! - `ManageCookies`, only for an `Import`/`Export` operation
//! - anything whose type name contains `Wait`, `Scroll` or `MouseMove`
//!
//! All name comparisons are case-insensitive.

use serde_json::Value;

use apiary_common::params;

const ALWAYS_ALLOWED: [&str; 4] = ["navigate", "type", "click", "waitforelement"];
const NAME_FRAGMENTS: [&str; 3] = ["wait", "scroll", "mousemove"];

/// Whether a command of this kind, with these parameters, may run during
/// an intervention
#[must_use]
pub fn allows(kind: &str, parameters: &Value) -> bool {
    let lowered = kind.to_ascii_lowercase();

    if ALWAYS_ALLOWED.contains(&lowered.as_str()) {
        return true;
    }

    if lowered == "executescript" {
        return params::get_ci(parameters, "safe").is_some_and(params::is_truthy);
    }

    if lowered == "managecookies" {
        return cookie_operation(parameters)
            .is_some_and(|op| op.eq_ignore_ascii_case("import") || op.eq_ignore_ascii_case("export"));
    }

    NAME_FRAGMENTS
        .iter()
        .any(|fragment| lowered.contains(fragment))
}

fn cookie_operation(parameters: &Value) -> Option<&str> {
    params::str_ci(parameters, "operation").or_else(|| params::str_ci(parameters, "action"))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_core_commands_allowed() {
        for kind in ["Navigate", "Type", "Click", "WaitForElement", "CLICK"] {
            assert!(allows(kind, &json!({})), "{kind} should be allowed");
        }
    }

    #[test]
    fn test_execute_script_needs_safe_flag() {
        assert!(allows("ExecuteScript", &json!({"safe": true})));
        assert!(allows("ExecuteScript", &json!({"Safe": "true"})));
        assert!(!allows("ExecuteScript", &json!({"safe": false})));
        assert!(!allows("ExecuteScript", &json!({})));
    }

    #[test]
    fn test_manage_cookies_import_export_only() {
        assert!(allows("ManageCookies", &json!({"operation": "Import"})));
        assert!(allows("ManageCookies", &json!({"action": "export"})));
        assert!(!allows("ManageCookies", &json!({"operation": "Clear"})));
        assert!(!allows("ManageCookies", &json!({})));
    }

    #[test]
    fn test_name_fragment_rules() {
        assert!(allows("WaitForNavigation", &json!({})));
        assert!(allows("ScrollIntoView", &json!({})));
        assert!(allows("SmoothMouseMove", &json!({})));
        assert!(!allows("DeleteAllData", &json!({})));
        assert!(!allows("Submit", &json!({})));
    }
}
