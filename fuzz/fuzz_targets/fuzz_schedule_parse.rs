#![no_main]
use libfuzzer_sys::fuzz_target;
use powerwatch::outage::parse;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let Some(date) = chrono::NaiveDate::from_ymd_opt(2025, 1, 10) else {
        return;
    };

    let _ = parse::parse_group_windows(text, "4.1", date);
    let _ = parse::lvivoblenergo_today_html(text);
    let _ = parse::yasno_windows(text, "2.1", date);
});
