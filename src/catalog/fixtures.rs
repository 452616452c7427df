//! Origin page fixtures shared by catalog and pipeline tests.

pub const BASE: &str = "https://origin.test";

/// Brand listing linking each `(id, nickname, display name)`, plus an image link per item.
pub fn listing_page(brand: &str, items: &[(i64, &str, &str)]) -> String {
    let links: String = items
        .iter()
        .map(|(id, nickname, name)| {
            format!(
                r#"<a href="/perfume/{brand}/{nickname}-{id}.html"><img src="x.jpg"></a>
                   <a href="/perfume/{brand}/{nickname}-{id}.html">{name}</a>"#
            )
        })
        .collect();
    format!(r#"<html><body><div class="designer-list">{links}<a href="/news/1.html">News</a></div></body></html>"#)
}

pub fn item_path(brand: &str, nickname: &str, id: i64) -> String {
    format!("/perfume/{}/{}-{}.html", brand, nickname, id)
}

pub fn item_url(brand: &str, nickname: &str, id: i64) -> String {
    format!("{}{}", BASE, item_path(brand, nickname, id))
}

/// Item page with one perfumer credit, the given notes and a rating box holding `rating`.
pub fn item_page(perfumer: &str, notes: &[&str], rating: &str, reviews: &[(&str, &str, &str)]) -> String {
    let notes: String = notes
        .iter()
        .map(|note| format!(r#"<div><a href="{BASE}/notes/{note}-1.html"><img src="n.jpg"></a>{note}</div>"#))
        .collect();
    let reviews: String = reviews
        .iter()
        .map(|(member_id, member, text)| {
            format!(
                r#"<div itemprop="review"><b class="idLinkify" title="/member/{member_id}">{member}</b>
                   <div itemprop="reviewBody">{text}</div></div>"#
            )
        })
        .collect();
    format!(
        r#"<html><body>
        <div><div><span>Perfumer</span></div><div><a href="/noses/x.html">{perfumer}</a></div></div>
        <div class="cell accord-box">woody</div>
        <div class="notes">{notes}</div>
        <p class="info-note">Rating <span>{rating}</span> out of <span>5</span> with <span>1,024</span> votes</p>
        {reviews}
        </body></html>"#
    )
}
