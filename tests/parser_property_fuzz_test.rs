use page_glue::Page;
use proptest::collection::vec;
use proptest::prelude::*;

fn tag_strategy() -> BoxedStrategy<&'static str> {
    prop_oneof![
        Just("div"),
        Just("span"),
        Just("section"),
        Just("p"),
        Just("article"),
        Just("b"),
    ]
    .boxed()
}

fn class_strategy() -> BoxedStrategy<&'static str> {
    prop_oneof![
        Just(""),
        Just("alert"),
        Just("alert alert-danger"),
        Just("alert alert-success extra"),
        Just("card"),
        Just("needs-validation"),
    ]
    .boxed()
}

fn fragment_strategy() -> BoxedStrategy<&'static str> {
    prop_oneof![
        Just("<div class='alert'>"),
        Just("</div>"),
        Just("</p>"),
        Just("<span>"),
        Just("</span>"),
        Just("<input required>"),
        Just("<br>"),
        Just("<!-- note -->"),
        Just("plain text "),
        Just("<b>bold</b>"),
        Just("<form class='needs-validation'>"),
        Just("</form>"),
        Just("<img src='x.png'>"),
    ]
    .boxed()
}

proptest! {
    #[test]
    fn generated_documents_schedule_one_timer_per_alert(
        blocks in vec((tag_strategy(), class_strategy(), "[a-zA-Z0-9 ]{0,12}"), 0..24)
    ) {
        let mut html = String::new();
        let mut alerts = 0usize;
        for (tag, class, text) in &blocks {
            if class.split_whitespace().any(|token| token == "alert") {
                alerts += 1;
            }
            if class.is_empty() {
                html.push_str(&format!("<{tag}>{text}</{tag}>"));
            } else {
                html.push_str(&format!("<{tag} class='{class}'>{text}</{tag}>"));
            }
        }

        let page = Page::from_html(&html).expect("well-formed markup should parse");
        prop_assert_eq!(page.pending_timers().len(), alerts);
        prop_assert_eq!(page.count(".alert").expect("query"), alerts);
    }

    #[test]
    fn arbitrary_fragment_soup_never_panics(fragments in vec(fragment_strategy(), 0..32)) {
        let html: String = fragments.concat();
        let _ = Page::from_html(&html);
    }

    #[test]
    fn quoted_attribute_values_round_trip(value in "[a-zA-Z0-9 _.,:-]{0,20}") {
        let html = format!("<input id='field' value=\"{value}\">");
        let page = Page::from_html(&html).expect("markup should parse");
        prop_assert_eq!(page.value("#field").expect("field exists"), value);
    }

    #[test]
    fn nested_well_formed_markup_keeps_text_reachable(
        tags in vec(tag_strategy(), 1..8),
        text in "[a-zA-Z0-9 ]{1,12}",
    ) {
        let mut html = String::new();
        for tag in &tags {
            html.push_str(&format!("<{tag}>"));
        }
        html.push_str("<i id='leaf'>");
        html.push_str(&text);
        html.push_str("</i>");
        for tag in tags.iter().rev() {
            html.push_str(&format!("</{tag}>"));
        }

        let page = Page::from_html(&html).expect("well-formed markup should parse");
        prop_assert_eq!(page.text("#leaf").expect("leaf exists"), text);
    }
}
