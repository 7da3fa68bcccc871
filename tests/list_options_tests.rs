//! Integration tests for list option decoding

use operator_api_proxy::requestinfo::list_options::{
    is_valid_path_segment_name, parse_bool, validate_label_selector,
};
use operator_api_proxy::requestinfo::{selector_as_equality_map, FieldSelector, ListOptions};

// ============================================================================
// Query Parameters
// ============================================================================

#[test]
fn decodes_all_parameters() {
    let opts = ListOptions::from_query(Some(
        "labelSelector=app%3Dweb&fieldSelector=metadata.namespace%3Ddefault&watch=true\
         &allowWatchBookmarks=true&resourceVersion=42&resourceVersionMatch=NotOlderThan\
         &continue=abc&timeoutSeconds=30&limit=500",
    ))
    .unwrap();

    assert_eq!(opts.label_selector.as_deref(), Some("app=web"));
    assert_eq!(
        opts.field_selector
            .as_ref()
            .and_then(|fs| fs.requires_exact_match("metadata.namespace")),
        Some("default")
    );
    assert!(opts.watch);
    assert!(opts.allow_watch_bookmarks);
    assert!(!opts.send_initial_events);
    assert_eq!(opts.resource_version.as_deref(), Some("42"));
    assert_eq!(opts.resource_version_match.as_deref(), Some("NotOlderThan"));
    assert_eq!(opts.continue_token.as_deref(), Some("abc"));
    assert_eq!(opts.timeout_seconds, Some(30));
    assert_eq!(opts.limit, Some(500));
}

#[test]
fn first_value_of_repeated_parameter_wins() {
    let opts = ListOptions::from_query(Some("watch=false&watch=true")).unwrap();
    assert!(!opts.watch);
}

#[test]
fn empty_query_is_default() {
    assert_eq!(ListOptions::from_query(None).unwrap(), ListOptions::default());
    assert_eq!(ListOptions::from_query(Some("")).unwrap(), ListOptions::default());
}

#[test]
fn non_integer_limit_is_an_error() {
    assert!(ListOptions::from_query(Some("limit=ten")).is_err());
    assert!(ListOptions::from_query(Some("timeoutSeconds=1.5")).is_err());
}

#[test]
fn booleans_never_fail() {
    assert!(parse_bool("true"));
    assert!(parse_bool(""));
    assert!(parse_bool("yes"));
    assert!(!parse_bool("0"));
    assert!(!parse_bool("False"));
}

#[test]
fn watch_only_keeps_just_the_watch_flag() {
    let opts = ListOptions::watch_only(Some("watch=1&limit=ten"));
    assert!(opts.watch);
    assert_eq!(opts.limit, None);
}

// ============================================================================
// Field Selectors
// ============================================================================

#[test]
fn field_selector_operators() {
    let fs = FieldSelector::parse("metadata.name==web,status.phase!=Running").unwrap();
    assert_eq!(fs.requires_exact_match("metadata.name"), Some("web"));
    assert_eq!(fs.requires_exact_match("status.phase"), None);
    assert!(!fs.is_name_only());

    assert!(FieldSelector::parse("metadata.name=web").unwrap().is_name_only());
}

#[test]
fn field_selector_escapes() {
    let fs = FieldSelector::parse(r"spec.value=a\,b\=c\\d").unwrap();
    assert_eq!(fs.requires_exact_match("spec.value"), Some(r"a,b=c\d"));

    assert!(FieldSelector::parse(r"spec.value=a\x").is_err());
    assert!(FieldSelector::parse("spec.value").is_err());
}

// ============================================================================
// Label Selectors
// ============================================================================

#[test]
fn label_selector_grammar() {
    for selector in [
        "app",
        "!app",
        "app=web",
        "app==web",
        "app!=web",
        "app in (web,db)",
        "tier notin (cache)",
        "replicas>1",
        "example.com/role=primary,app",
    ] {
        assert!(validate_label_selector(selector).is_ok(), "{selector}");
    }
    for selector in ["a in", "app=we b", "=web", "replicas>one", "app in ()"] {
        assert!(validate_label_selector(selector).is_err(), "{selector}");
    }
}

#[test]
fn equality_map_rejects_set_based_selectors() {
    let labels = selector_as_equality_map("app=web,tier=front").unwrap();
    assert_eq!(labels.len(), 2);
    assert_eq!(labels["tier"], "front");

    assert!(selector_as_equality_map("app in (web)").is_err());
    assert!(selector_as_equality_map("!app").is_err());
}

#[test]
fn path_segment_names() {
    assert!(is_valid_path_segment_name("web-0"));
    assert!(!is_valid_path_segment_name(".."));
    assert!(!is_valid_path_segment_name("a/b"));
    assert!(!is_valid_path_segment_name("a%2F"));
}
