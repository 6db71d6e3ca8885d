use std::collections::BTreeMap;

use super::*;
use crate::test_utils::*;

fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

#[test]
fn test_label_selector_operators() {
    let set = labels(&[("app", "web"), ("tier", "front")]);
    let cases = [
        ("", true),
        ("app=web", true),
        ("app==web", true),
        ("app!=web", false),
        ("app=db", false),
        ("app in (db, web)", true),
        ("app notin (db,web)", false),
        ("env notin (prod)", true),
        ("tier", true),
        ("!tier", false),
        ("!env", true),
        ("app=web,tier=front", true),
        ("app=web,tier=back", false),
    ];
    for (selector, expected) in cases {
        let parsed = LabelSelector::parse(selector).unwrap();
        assert_eq!(parsed.matches(&set), expected, "selector `{selector}`");
    }
}

#[test]
fn test_label_selector_rejects_malformed_input() {
    for selector in ["app in (a,b", "app)", "=web", "a b=c", "app in a,b"] {
        let err = LabelSelector::parse(selector).unwrap_err();
        assert!(err.is_invalid(), "selector `{selector}`");
    }
}

#[test]
fn test_label_selector_display_parses_back() {
    let selector = LabelSelector::parse("app in (web,db), !legacy,tier!=back").unwrap();
    let shown = selector.to_string();
    assert_eq!(shown, "app in (db,web),!legacy,tier!=back");
    assert_eq!(LabelSelector::parse(&shown).unwrap(), selector);
}

#[test]
fn test_field_selector_equality_only() {
    let p = pod_on_node("ns", "foo", "n1");
    let fields = p.fields();
    assert!(FieldSelector::parse("spec.nodeName=n1").unwrap().matches(&fields));
    assert!(FieldSelector::parse("metadata.namespace!=other").unwrap().matches(&fields));
    assert!(!FieldSelector::equals("metadata.name", "bar").matches(&fields));
    assert!(FieldSelector::parse("spec.nodeName in (n1)").unwrap_err().is_invalid());
}

#[test]
fn test_predicate_combines_label_and_field() {
    let mut p = pod_on_node("ns", "foo", "n1");
    p.metadata.labels.insert("app".into(), "web".into());

    let both = SelectionPredicate::new(
        LabelSelector::parse("app=web").unwrap(),
        FieldSelector::equals("spec.nodeName", "n1"),
    );
    assert!(both.matches(&p));

    let wrong_node = SelectionPredicate::new(
        LabelSelector::parse("app=web").unwrap(),
        FieldSelector::equals("spec.nodeName", "n2"),
    );
    assert!(!wrong_node.matches(&p));

    assert!(SelectionPredicate::everything().is_everything());
    assert!(SelectionPredicate::everything().with_bookmarks().matches(&p));
}
