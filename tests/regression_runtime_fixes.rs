use page_glue::{ALERT_DISMISS_MS, HandlerAction, Page};

#[test]
fn dismiss_timers_bind_each_alert_not_the_last_one() -> page_glue::Result<()> {
    // Regression guard for the classic shared-loop-variable defect: removing
    // the last alert must not disturb the timers of the earlier ones.
    let mut page = Page::from_html(
        r#"
        <div id='a' class='alert'>first</div>
        <div id='b' class='alert'>second</div>
        <div id='c' class='alert'>third</div>
        "#,
    )?;
    page.remove_element("#c")?;
    page.advance_time(ALERT_DISMISS_MS)?;
    page.assert_hidden("#a")?;
    page.assert_hidden("#b")?;
    Ok(())
}

#[test]
fn guard_rechecks_validity_on_every_attempt() -> page_glue::Result<()> {
    let mut page = Page::from_html(
        r#"
        <form id='f' class='needs-validation'>
          <input name='phone' required minlength='10'>
          <button id='send' type='submit'>Send</button>
        </form>
        "#,
    )?;

    page.click("#send")?;
    assert!(page.submissions().is_empty());

    page.type_text("input[name=phone]", "0123456789")?;
    page.click("#send")?;
    assert_eq!(page.submissions().len(), 1);

    page.type_text("input[name=phone]", "012")?;
    page.click("#send")?;
    assert_eq!(page.submissions().len(), 1);
    Ok(())
}

#[test]
fn guarded_forms_do_not_interfere_with_each_other() -> page_glue::Result<()> {
    let mut page = Page::from_html(
        r#"
        <form id='broken' class='needs-validation'>
          <input name='who' required>
          <button id='b1' type='submit'>One</button>
        </form>
        <form id='fine' class='needs-validation' action='/ok'>
          <input name='what' value='ready'>
          <button id='b2' type='submit'>Two</button>
        </form>
        "#,
    )?;
    page.click("#b1")?;
    page.click("#b2")?;
    assert_eq!(page.submissions().len(), 1);
    assert_eq!(page.submissions()[0].action, "/ok");
    Ok(())
}

#[test]
fn lookahead_patterns_work_for_password_rules() -> page_glue::Result<()> {
    let page = Page::from_html(
        r#"
        <input id='strong' type='password' pattern='(?=.*[0-9]).{8,}' value='abc12345'>
        <input id='weak' type='password' pattern='(?=.*[0-9]).{8,}' value='abcdefgh'>
        "#,
    )?;
    assert!(page.check_validity("#strong")?);
    assert!(!page.check_validity("#weak")?);
    Ok(())
}

#[test]
fn timers_due_exactly_at_the_new_clock_run() -> page_glue::Result<()> {
    let mut page = Page::from_html("<div id='d'>d</div>")?;
    page.schedule_hide("#d", 250)?;
    page.advance_time(250)?;
    page.assert_hidden("#d")?;
    Ok(())
}

#[test]
fn cleared_queue_accepts_new_work() -> page_glue::Result<()> {
    let mut page = Page::from_html("<div id='a' class='alert'>a</div>")?;
    assert_eq!(page.clear_all_timers(), 1);
    page.schedule_hide("#a", 10)?;
    page.advance_time(10)?;
    page.assert_hidden("#a")?;
    Ok(())
}

#[test]
fn ready_can_be_deferred_with_no_alerts_present() -> page_glue::Result<()> {
    let mut page = Page::from_html_loading("<form class='needs-validation'></form>")?;
    page.fire_ready()?;
    assert!(page.pending_timers().is_empty());
    assert!(matches!(
        page.fire_ready(),
        Err(page_glue::Error::Runtime(_))
    ));
    Ok(())
}

#[test]
fn submission_entries_capture_checkable_and_multiline_controls() -> page_glue::Result<()> {
    let mut page = Page::from_html(
        r#"
        <form id='f'>
          <input type='checkbox' name='notify' checked>
          <input type='radio' name='slot' value='am' checked>
          <input type='radio' name='slot' value='pm'>
          <textarea name='notes'>bring reports</textarea>
          <select name='dept'>
            <option value='cardio' selected>Cardio</option>
            <option value='derm'>Derm</option>
          </select>
        </form>
        "#,
    )?;
    page.submit("#f")?;
    assert_eq!(
        page.submissions()[0].entries,
        vec![
            ("notify".to_string(), "on".to_string()),
            ("slot".to_string(), "am".to_string()),
            ("notes".to_string(), "bring reports".to_string()),
            ("dept".to_string(), "cardio".to_string()),
        ]
    );
    Ok(())
}

#[test]
fn capture_listeners_on_ancestors_see_submit_before_the_guard() -> page_glue::Result<()> {
    let mut page = Page::from_html(
        r#"
        <div id='wrap'>
          <form id='f' class='needs-validation'>
            <input name='who' required>
          </form>
        </div>
        "#,
    )?;
    page.add_capture_listener("#wrap", "submit", HandlerAction::Log("seen".into()))?;
    page.submit("#f")?;
    assert!(page.submissions().is_empty());
    assert_eq!(page.console_lines().last().map(String::as_str), Some("seen"));
    Ok(())
}
