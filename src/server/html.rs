//! HTML documents served to the browser.
//!
//! The main page embeds its parameters as JSON and runs a small script that
//! keeps exactly one image request in flight, attaching the input events it has
//! not yet seen acknowledged. Pre-main and prev pages only steer the browser
//! history (see `core::window`).

use serde::Serialize;

/// Parameters the main page script needs
#[derive(Debug, Clone, Serialize)]
pub struct MainPageParams {
    /// Main generation this page belongs to
    pub main: u64,
    /// Last started image generation; the page counts up from here
    pub img: u64,
}

const MAIN_PAGE_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>frameway</title>
<style>
html, body { margin: 0; padding: 0; overflow: hidden; background: #fff; }
#view { display: block; user-select: none; -webkit-user-drag: none; }
</style>
</head>
<body>
<img id="view" alt="">
<script>
"use strict";
const params = __PARAMS__;
const view = document.getElementById("view");
let imgIdx = params.img;
let ackedEvents = 0;
let pending = [];
let inFlight = false;

function pos(e) {
    const r = view.getBoundingClientRect();
    return Math.round(e.clientX - r.left) + "_" + Math.round(e.clientY - r.top);
}
function push(token) {
    pending.push(token);
    requestFrame();
}

view.addEventListener("mousedown", e => { push("MDN_" + pos(e) + "_" + e.button); e.preventDefault(); });
view.addEventListener("mouseup", e => { push("MUP_" + pos(e) + "_" + e.button); e.preventDefault(); });
view.addEventListener("dblclick", e => { push("MDBL_" + pos(e)); e.preventDefault(); });
view.addEventListener("mousemove", e => push("MMO_" + pos(e)));
view.addEventListener("mouseleave", e => push("MOUT_" + pos(e)));
view.addEventListener("contextmenu", e => e.preventDefault());
view.addEventListener("wheel", e => { push("MWH_" + pos(e) + "_" + Math.round(e.deltaY)); e.preventDefault(); }, { passive: false });
window.addEventListener("keydown", e => {
    if (e.altKey && e.key === "ArrowRight") {
        fetch("next", { cache: "no-store" }).catch(() => {});
    } else {
        push("KDN_" + e.keyCode);
    }
    e.preventDefault();
});
window.addEventListener("keyup", e => { push("KUP_" + e.keyCode); e.preventDefault(); });
window.addEventListener("blur", () => push("FOUT"));
window.addEventListener("resize", () => requestFrame());

function requestFrame() {
    if (inFlight) {
        return;
    }
    inFlight = true;
    imgIdx += 1;
    const batch = pending.slice();
    const start = ackedEvents;
    const url = "image?main=" + params.main + "&img=" + imgIdx + "&start=" + start +
        "&w=" + window.innerWidth + "&h=" + window.innerHeight +
        "&events=" + encodeURIComponent(batch.join("/"));
    fetch(url, { cache: "no-store" })
        .then(r => {
            if (!r.ok) {
                throw new Error("HTTP " + r.status);
            }
            pending.splice(0, batch.length);
            ackedEvents = start + batch.length;
            return r.blob();
        })
        .then(blob => {
            if (blob.size > 0) {
                const old = view.src;
                view.src = URL.createObjectURL(blob);
                if (old) {
                    URL.revokeObjectURL(old);
                }
            }
        })
        .catch(() => {})
        .finally(() => {
            inFlight = false;
            setTimeout(requestFrame, 40);
        });
}
requestFrame();
</script>
</body>
</html>
"#;

/// Main page for one main generation.
pub fn main_page(params: &MainPageParams) -> String {
    let json = serde_json::to_string(params).unwrap_or_else(|_| "{}".to_string());
    MAIN_PAGE_TEMPLATE.replace("__PARAMS__", &json)
}

/// Script-only page; `script` runs as soon as it loads.
fn redirect_page(script: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>frameway</title></head>\
         <body><script>{}</script></body></html>\n",
        script
    )
}

/// First load of a window: continue to the tokenized `prev` page without
/// leaving this page in the history.
pub fn pre_main_page(csrf_token: &str) -> String {
    redirect_page(&format!("location.replace(\"{}/prev\");", csrf_token))
}

/// First `prev` visit: push the main page on top of it.
pub fn prev_first_visit_page() -> String {
    redirect_page("location.href = \"./\";")
}

/// Later `prev` visits come from the Back button: return to the main page.
pub fn prev_return_page() -> String {
    redirect_page("history.forward(); setTimeout(() => location.replace(\"./\"), 500);")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_main_page_embeds_params() {
        let page = main_page(&MainPageParams { main: 4, img: 91 });
        assert!(page.contains(r#"const params = {"main":4,"img":91};"#));
        assert!(!page.contains("__PARAMS__"));
    }

    #[test]
    fn test_pre_main_page_targets_tokenized_prev() {
        let page = pre_main_page("abc123");
        assert!(page.contains(r#"location.replace("abc123/prev")"#));
    }
}
