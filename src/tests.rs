use super::*;
use std::cell::RefCell;

const THREE_EVENTS_HTML: &str = r#"
    <ul id='timeline'>
      <li id='a' class='event'>breakfast</li>
      <li id='b' class='event'>meeting</li>
      <li id='c' class='event'>dinner</li>
    </ul>
    "#;

fn page_with_toggler(html: &str) -> Result<Page> {
    let mut page = Page::from_html(html)?;
    ClassToggler::default().attach(&mut page)?;
    Ok(page)
}

fn assert_markers_exclusive(page: &Page, config: &TogglerConfig) -> Result<()> {
    let members = page.query_all(&config.selector)?;
    let tops = members
        .iter()
        .filter(|node| page.dom().has_class(**node, &config.top_class))
        .count();
    let bottoms = members
        .iter()
        .filter(|node| page.dom().has_class(**node, &config.bottom_class))
        .count();
    let both = members
        .iter()
        .filter(|node| {
            page.dom().has_class(**node, &config.top_class)
                && page.dom().has_class(**node, &config.bottom_class)
        })
        .count();
    assert!(tops <= 1, "more than one {} member", config.top_class);
    assert!(bottoms <= 1, "more than one {} member", config.bottom_class);
    assert_eq!(both, 0, "an element carries both markers");
    Ok(())
}

#[test]
fn single_element_cycles_with_period_three() -> Result<()> {
    let mut page = page_with_toggler(THREE_EVENTS_HTML)?;

    for _ in 0..2 {
        page.click("#a")?;
        page.assert_has_class("#a", "topmost", true)?;
        page.assert_has_class("#a", "bottommost", false)?;

        page.click("#a")?;
        page.assert_has_class("#a", "topmost", false)?;
        page.assert_has_class("#a", "bottommost", true)?;

        page.click("#a")?;
        page.assert_has_class("#a", "topmost", false)?;
        page.assert_has_class("#a", "bottommost", false)?;
    }
    Ok(())
}

#[test]
fn click_sequence_follows_scenario() -> Result<()> {
    let mut page = page_with_toggler(THREE_EVENTS_HTML)?;

    page.click("#a")?;
    page.assert_has_class("#a", "topmost", true)?;
    page.assert_has_class("#b", "topmost", false)?;
    page.assert_has_class("#c", "topmost", false)?;

    page.click("#a")?;
    page.assert_has_class("#a", "bottommost", true)?;
    page.assert_has_class("#a", "topmost", false)?;

    page.click("#b")?;
    page.assert_has_class("#a", "topmost", false)?;
    page.assert_has_class("#a", "bottommost", false)?;
    page.assert_has_class("#b", "topmost", true)?;

    page.click("#b")?;
    page.assert_has_class("#b", "bottommost", true)?;

    page.click("#c")?;
    page.assert_has_class("#b", "topmost", false)?;
    page.assert_has_class("#b", "bottommost", false)?;
    page.assert_has_class("#c", "topmost", true)?;
    Ok(())
}

#[test]
fn switching_elements_clears_the_previous_marker() -> Result<()> {
    let mut page = page_with_toggler(THREE_EVENTS_HTML)?;

    page.click("#a")?;
    page.click("#b")?;

    page.assert_has_class("#a", "topmost", false)?;
    page.assert_has_class("#a", "bottommost", false)?;
    page.assert_has_class("#b", "topmost", true)?;
    Ok(())
}

#[test]
fn clicking_a_bottommost_element_leaves_the_set_unmarked() -> Result<()> {
    let mut page = page_with_toggler(THREE_EVENTS_HTML)?;

    page.click("#a")?;
    page.click("#a")?;
    page.assert_has_class("#a", "bottommost", true)?;

    page.click("#a")?;
    for selector in ["#a", "#b", "#c"] {
        page.assert_has_class(selector, "topmost", false)?;
        page.assert_has_class(selector, "bottommost", false)?;
    }
    Ok(())
}

#[test]
fn markers_stay_exclusive_across_mixed_clicks() -> Result<()> {
    let mut page = page_with_toggler(THREE_EVENTS_HTML)?;
    let config = TogglerConfig::default();

    for selector in ["#a", "#a", "#b", "#c", "#c", "#c", "#b", "#a", "#b"] {
        page.click(selector)?;
        assert_markers_exclusive(&page, &config)?;
    }
    Ok(())
}

#[test]
fn reattach_binds_nothing_and_does_not_double_fire() -> Result<()> {
    let mut page = Page::from_html(THREE_EVENTS_HTML)?;
    let toggler = ClassToggler::default();

    assert_eq!(toggler.attach(&mut page)?, 3);
    assert_eq!(toggler.attach(&mut page)?, 0);

    // A double-fired handler would advance the cycle twice and land on
    // bottommost here.
    page.click("#a")?;
    page.assert_has_class("#a", "topmost", true)?;
    page.assert_has_class("#a", "bottommost", false)?;
    Ok(())
}

#[test]
fn attach_without_matches_binds_zero_handlers() -> Result<()> {
    let mut page = Page::from_html("<div id='lonely'>nothing here</div>")?;
    let bound = ClassToggler::default().attach(&mut page)?;
    assert_eq!(bound, 0);

    page.click("#lonely")?;
    page.assert_has_class("#lonely", "topmost", false)?;
    Ok(())
}

#[test]
fn attach_rejects_unsupported_selectors() -> Result<()> {
    let mut page = Page::from_html(THREE_EVENTS_HTML)?;
    let toggler = ClassToggler::new(TogglerConfig {
        selector: "li:hover".into(),
        ..TogglerConfig::default()
    });
    assert!(matches!(
        toggler.attach(&mut page),
        Err(Error::UnsupportedSelector(_))
    ));
    Ok(())
}

#[test]
fn custom_selector_and_marker_classes_are_honored() -> Result<()> {
    let html = r#"
        <div id='x' class='entry'>x</div>
        <div id='y' class='entry'>y</div>
        "#;
    let mut page = Page::from_html(html)?;
    let toggler = ClassToggler::new(TogglerConfig {
        selector: ".entry".into(),
        top_class: "first".into(),
        bottom_class: "last".into(),
    });
    assert_eq!(toggler.attach(&mut page)?, 2);

    page.click("#x")?;
    page.assert_has_class("#x", "first", true)?;
    page.click("#x")?;
    page.assert_has_class("#x", "last", true)?;
    page.click("#y")?;
    page.assert_has_class("#x", "last", false)?;
    page.assert_has_class("#y", "first", true)?;
    Ok(())
}

#[test]
fn elements_outside_the_set_keep_their_classes() -> Result<()> {
    let html = r#"
        <div id='member' class='event'>in</div>
        <div id='outsider' class='topmost'>out</div>
        "#;
    let mut page = page_with_toggler(html)?;

    page.click("#member")?;
    page.assert_has_class("#member", "topmost", true)?;
    page.assert_has_class("#outsider", "topmost", true)?;
    Ok(())
}

#[test]
fn preexisting_marker_from_html_is_respected() -> Result<()> {
    let html = r#"
        <div id='a' class='event topmost'>a</div>
        <div id='b' class='event'>b</div>
        "#;
    let mut page = page_with_toggler(html)?;

    page.click("#a")?;
    page.assert_has_class("#a", "topmost", false)?;
    page.assert_has_class("#a", "bottommost", true)?;
    Ok(())
}

#[test]
fn clicking_an_unbound_element_changes_nothing() -> Result<()> {
    let mut page = page_with_toggler(THREE_EVENTS_HTML)?;

    page.click("#timeline")?;
    for selector in ["#a", "#b", "#c"] {
        page.assert_has_class(selector, "topmost", false)?;
        page.assert_has_class(selector, "bottommost", false)?;
    }
    Ok(())
}

#[test]
fn click_on_missing_selector_reports_not_found() -> Result<()> {
    let mut page = Page::from_html(THREE_EVENTS_HTML)?;
    assert!(matches!(
        page.click("#missing"),
        Err(Error::SelectorNotFound(_))
    ));
    Ok(())
}

#[test]
fn marker_cycle_is_asymmetric() {
    assert_eq!(next_marker(Marker::Unmarked), Marker::Topmost);
    assert_eq!(next_marker(Marker::Topmost), Marker::Bottommost);
    // Bottommost drops back to unmarked instead of wrapping to topmost.
    assert_eq!(next_marker(Marker::Bottommost), Marker::Unmarked);
}

#[test]
fn marker_of_prefers_topmost_when_both_classes_present() -> Result<()> {
    let html = "<div id='odd' class='event topmost bottommost'>odd</div>";
    let page = Page::from_html(html)?;
    let toggler = ClassToggler::default();
    let node = page.dom().by_id("odd").unwrap();
    assert_eq!(toggler.marker_of(page.dom(), node), Marker::Topmost);
    Ok(())
}

#[test]
fn add_class_deduplicates_and_preserves_order() -> Result<()> {
    let mut page = Page::from_html("<div id='d' class='one'>d</div>")?;
    let node = page.dom().by_id("d").unwrap();

    page.dom_mut().add_class(node, "two");
    page.dom_mut().add_class(node, "one");
    page.dom_mut().add_class(node, "two");

    assert_eq!(page.dom().class_list(node), vec!["one", "two"]);
    assert_eq!(page.dom().attr(node, "class").as_deref(), Some("one two"));
    Ok(())
}

#[test]
fn remove_class_normalizes_surrounding_whitespace() -> Result<()> {
    let mut page = Page::from_html("<div id='d' class='  alpha   beta  gamma '>d</div>")?;
    let node = page.dom().by_id("d").unwrap();

    page.dom_mut().remove_class(node, "beta");
    assert_eq!(page.dom().attr(node, "class").as_deref(), Some("alpha gamma"));

    page.dom_mut().remove_class(node, "missing");
    assert_eq!(page.dom().attr(node, "class").as_deref(), Some("alpha gamma"));
    Ok(())
}

#[test]
fn class_queries_on_text_nodes_are_inert() -> Result<()> {
    let mut page = Page::from_html("<p id='p'>hello</p>")?;
    let paragraph = page.dom().by_id("p").unwrap();
    let text = page.dom().children(paragraph)[0];

    assert!(!page.dom().has_class(text, "anything"));
    page.dom_mut().add_class(text, "anything");
    assert!(page.dom().class_list(text).is_empty());
    Ok(())
}

#[test]
fn query_selector_all_supports_the_selector_subset() -> Result<()> {
    let html = r#"
        <div id='wrap' class='box outer'>
          <span class='box'>one</span>
          <p>
            <span class='box deep'>two</span>
          </p>
        </div>
        <span id='stray'>three</span>
        "#;
    let page = Page::from_html(html)?;
    let dom = page.dom();

    assert_eq!(dom.query_selector_all("span")?.len(), 3);
    assert_eq!(dom.query_selector_all(".box")?.len(), 3);
    assert_eq!(dom.query_selector_all("span.box")?.len(), 2);
    assert_eq!(dom.query_selector_all("#wrap")?.len(), 1);
    assert_eq!(dom.query_selector_all("div.box.outer")?.len(), 1);
    assert_eq!(dom.query_selector_all(".outer .box")?.len(), 2);
    assert_eq!(dom.query_selector_all(".outer > .box")?.len(), 1);
    assert_eq!(dom.query_selector_all("p > .deep")?.len(), 1);
    assert_eq!(dom.query_selector_all("*")?.len(), 5);
    Ok(())
}

#[test]
fn selector_groups_deduplicate_matches_in_document_order() -> Result<()> {
    let html = r#"
        <div id='a' class='x'>a</div>
        <div id='b' class='x y'>b</div>
        "#;
    let page = Page::from_html(html)?;

    let matched = page.dom().query_selector_all(".x, .y, #a")?;
    let ids = matched
        .iter()
        .map(|node| page.dom().attr(*node, "id").unwrap_or_default())
        .collect::<Vec<_>>();
    assert_eq!(ids, vec!["a", "b"]);
    Ok(())
}

#[test]
fn unsupported_selector_syntax_is_rejected() -> Result<()> {
    let page = Page::from_html("<div>d</div>")?;
    for selector in ["", "  ", "[name=x]", "div:first-child", "a + b", "> div", "div >"] {
        assert!(
            matches!(
                page.dom().query_selector_all(selector),
                Err(Error::UnsupportedSelector(_))
            ),
            "selector {selector:?} should be rejected"
        );
    }
    Ok(())
}

#[test]
fn id_index_follows_attribute_updates() -> Result<()> {
    let mut page = Page::from_html("<div id='before'>d</div>")?;
    let node = page.dom().by_id("before").unwrap();

    page.dom_mut().set_attr(node, "id", "after")?;
    assert_eq!(page.dom().by_id("after"), Some(node));
    assert_eq!(page.dom().by_id("before"), None);

    page.dom_mut().remove_attr(node, "id")?;
    assert_eq!(page.dom().by_id("after"), None);
    Ok(())
}

#[test]
fn set_attr_on_text_node_is_an_error() -> Result<()> {
    let mut page = Page::from_html("<p id='p'>hello</p>")?;
    let paragraph = page.dom().by_id("p").unwrap();
    let text = page.dom().children(paragraph)[0];
    assert!(matches!(
        page.dom_mut().set_attr(text, "class", "x"),
        Err(Error::NotAnElement(_))
    ));
    Ok(())
}

#[test]
fn parser_handles_attribute_quoting_variants() -> Result<()> {
    let html = r#"<input id=plain class="a b" data-x='single' disabled>"#;
    let page = Page::from_html(html)?;
    let node = page.dom().by_id("plain").unwrap();

    assert_eq!(page.dom().attr(node, "class").as_deref(), Some("a b"));
    assert_eq!(page.dom().attr(node, "data-x").as_deref(), Some("single"));
    assert_eq!(page.dom().attr(node, "disabled").as_deref(), Some("true"));
    Ok(())
}

#[test]
fn parser_keeps_void_tags_from_swallowing_siblings() -> Result<()> {
    let html = "<div id='wrap'><br><span id='s'>after</span></div>";
    let page = Page::from_html(html)?;

    let span = page.dom().by_id("s").unwrap();
    assert_eq!(page.dom().parent(span), Some(page.dom().by_id("wrap").unwrap()));
    Ok(())
}

#[test]
fn parser_skips_comments_and_keeps_raw_script_text() -> Result<()> {
    let html = r#"
        <!-- decorative -->
        <p id='p'>kept</p>
        <script>if (a < b) { mark("<div>"); }</script>
        "#;
    let page = Page::from_html(html)?;

    page.assert_text("#p", "kept")?;
    // The script body is stored as text, not parsed as markup.
    assert!(page.dom().query_selector_all("div")?.is_empty());
    Ok(())
}

#[test]
fn parser_reports_malformed_input() {
    assert!(matches!(
        Page::from_html("<!-- never closed"),
        Err(Error::HtmlParse(_))
    ));
    assert!(matches!(
        Page::from_html("<div class='x"),
        Err(Error::HtmlParse(_))
    ));
    assert!(matches!(
        Page::from_html("<script>lost"),
        Err(Error::HtmlParse(_))
    ));
}

#[test]
fn listeners_fire_in_capture_target_bubble_order() -> Result<()> {
    let html = r#"
        <div id='outer'>
          <div id='inner'>
            <button id='btn'>go</button>
          </div>
        </div>
        "#;
    let mut page = Page::from_html(html)?;
    let outer = page.dom().by_id("outer").unwrap();
    let inner = page.dom().by_id("inner").unwrap();
    let btn = page.dom().by_id("btn").unwrap();

    let order = Rc::new(RefCell::new(Vec::new()));
    let record = |log: &Rc<RefCell<Vec<String>>>, label: &str| -> Handler {
        let log = Rc::clone(log);
        let label = label.to_string();
        Rc::new(move |_dom, _event| log.borrow_mut().push(label.clone()))
    };

    page.add_capture_listener(outer, "click", record(&order, "outer-capture"));
    page.add_listener(outer, "click", record(&order, "outer-bubble"));
    page.add_listener(inner, "click", record(&order, "inner-bubble"));
    page.add_listener(btn, "click", record(&order, "target"));

    page.click("#btn")?;
    assert_eq!(
        *order.borrow(),
        vec!["outer-capture", "target", "inner-bubble", "outer-bubble"]
    );
    Ok(())
}

#[test]
fn stop_propagation_halts_ancestor_listeners() -> Result<()> {
    let html = "<div id='outer'><button id='btn'>go</button></div>";
    let mut page = Page::from_html(html)?;
    let outer = page.dom().by_id("outer").unwrap();
    let btn = page.dom().by_id("btn").unwrap();

    let fired = Rc::new(RefCell::new(Vec::new()));
    let outer_log = Rc::clone(&fired);
    page.add_listener(
        outer,
        "click",
        Rc::new(move |_dom, _event| outer_log.borrow_mut().push("outer")),
    );
    let btn_log = Rc::clone(&fired);
    page.add_listener(
        btn,
        "click",
        Rc::new(move |_dom, event| {
            event.stop_propagation();
            btn_log.borrow_mut().push("btn");
        }),
    );

    page.click("#btn")?;
    assert_eq!(*fired.borrow(), vec!["btn"]);
    Ok(())
}

#[test]
fn stop_immediate_propagation_skips_later_listeners_on_the_same_node() -> Result<()> {
    let mut page = Page::from_html("<button id='btn'>go</button>")?;
    let btn = page.dom().by_id("btn").unwrap();

    let fired = Rc::new(RefCell::new(Vec::new()));
    let first = Rc::clone(&fired);
    page.add_listener(
        btn,
        "click",
        Rc::new(move |_dom, event| {
            event.stop_immediate_propagation();
            first.borrow_mut().push("first");
        }),
    );
    let second = Rc::clone(&fired);
    page.add_listener(
        btn,
        "click",
        Rc::new(move |_dom, _event| second.borrow_mut().push("second")),
    );

    page.click("#btn")?;
    assert_eq!(*fired.borrow(), vec!["first"]);
    Ok(())
}

#[test]
fn removed_listeners_no_longer_fire() -> Result<()> {
    let mut page = Page::from_html("<button id='btn'>go</button>")?;
    let btn = page.dom().by_id("btn").unwrap();

    let count = Rc::new(RefCell::new(0));
    let counter = Rc::clone(&count);
    let key = page.add_listener(
        btn,
        "click",
        Rc::new(move |_dom, _event| *counter.borrow_mut() += 1),
    );

    page.click("#btn")?;
    assert!(page.remove_listener(btn, "click", &key));
    assert!(!page.remove_listener(btn, "click", &key));
    page.click("#btn")?;

    assert_eq!(*count.borrow(), 1);
    Ok(())
}

#[test]
fn handlers_mutate_the_dom_they_are_given() -> Result<()> {
    let mut page = Page::from_html("<button id='btn' class='event'>go</button>")?;
    let btn = page.dom().by_id("btn").unwrap();

    page.add_listener(
        btn,
        "click",
        Rc::new(move |dom, event| dom.add_class(event.target(), "seen")),
    );
    page.click_node(btn);

    page.assert_has_class("#btn", "seen", true)?;
    Ok(())
}

#[test]
fn assertion_failures_carry_a_dom_snippet() -> Result<()> {
    let mut page = page_with_toggler("<div id='a' class='event'>a</div>")?;
    page.click("#a")?;

    let err = page
        .assert_has_class("#a", "topmost", false)
        .expect_err("marker should be present");
    match err {
        Error::AssertionFailed { dom_snippet, .. } => {
            assert!(dom_snippet.contains("topmost"), "snippet: {dom_snippet}");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    Ok(())
}

#[test]
fn trace_logs_record_click_dispatch() -> Result<()> {
    let mut page = page_with_toggler(THREE_EVENTS_HTML)?;
    page.enable_trace(true);
    page.set_trace_stderr(false);

    page.click("#a")?;
    let logs = page.take_trace_logs();
    assert!(!logs.is_empty());
    assert!(logs.iter().all(|line| line.starts_with("[event]")));
    assert!(logs.iter().any(|line| line.contains("target=li#a")));
    assert!(page.take_trace_logs().is_empty());
    Ok(())
}

#[test]
fn text_content_concatenates_descendants() -> Result<()> {
    let html = "<div id='d'>one <span>two</span> three</div>";
    let page = Page::from_html(html)?;
    page.assert_text("#d", "one two three")?;
    Ok(())
}
