//! HTML rendered by the provisioning portal
//!
//! Everything is served inline: phones joined to the setup access point
//! have no internet connection to fetch assets from.

use crate::services::network::ScannedNetwork;
use std::fmt::Write;

const STYLE: &str = r#"<style>
    body { font-family: -apple-system, BlinkMacSystemFont, sans-serif; background: #f4f4f4; color: #222; margin: 0; }
    .container { max-width: 420px; margin: 0 auto; padding: 20px; }
    .card { background: #fff; border-radius: 12px; padding: 24px; box-shadow: 0 2px 8px rgba(0,0,0,0.08); text-align: center; }
    .logo { font-weight: bold; font-size: 22px; letter-spacing: 1px; margin-bottom: 12px; }
    .networks { text-align: left; margin-top: 20px; }
    .network-item { display: flex; justify-content: space-between; padding: 12px; border-bottom: 1px solid #eee; cursor: pointer; }
    .signal { color: #888; font-size: 14px; }
    .notice { padding: 10px; color: #666; }
    .error { background: #fdecea; color: #b3261e; border-radius: 8px; padding: 10px; margin-bottom: 12px; }
    .modal-overlay { display: none; position: fixed; inset: 0; background: rgba(0,0,0,0.5); align-items: center; justify-content: center; }
    .modal { background: #fff; border-radius: 12px; padding: 20px; width: 85%; max-width: 360px; text-align: left; }
    input { width: 100%; padding: 10px; margin: 8px 0 16px; box-sizing: border-box; }
    button, .btn { display: inline-block; width: 100%; background: #000; color: #fff; border: 0; border-radius: 8px; padding: 14px; font-weight: bold; text-decoration: none; }
    .code { font-family: monospace; font-size: 24px; background: #eee; padding: 5px 10px; border-radius: 4px; letter-spacing: 2px; user-select: all; }
    .hidden { display: none; }
</style>"#;

const SELECT_SCRIPT: &str = r#"<script>
    function selectNetwork(ssid) {
        document.getElementById('modal-ssid').value = ssid;
        document.getElementById('modal-ssid-display').innerText = ssid;
        document.getElementById('modal-overlay').style.display = 'flex';
        document.getElementById('modal-password').focus();
    }
    function closeModal() {
        document.getElementById('modal-overlay').style.display = 'none';
    }
</script>"#;

const POLL_SCRIPT: &str = r#"<script>
    function show(id) { document.getElementById(id).classList.remove('hidden'); }
    function hide(id) { document.getElementById(id).classList.add('hidden'); }
    function checkStatus() {
        fetch('/status')
            .then(response => response.json())
            .then(data => {
                const text = document.getElementById('status-text');
                text.innerText = data.status;
                if (data.state === 'CONNECTED') {
                    hide('spinner');
                    show('next-steps');
                    show('claim-btn');
                    text.style.color = '#2ecc71';
                } else if (data.state === 'FAILED') {
                    hide('spinner');
                    text.style.color = 'red';
                    text.innerText = 'Connection Failed. ' + data.status;
                    show('retry-btn');
                } else {
                    setTimeout(checkStatus, 2000);
                }
            })
            .catch(() => setTimeout(checkStatus, 2000));
    }
    window.onload = checkStatus;
</script>"#;

pub const SCAN_FAILED: &str = r#"<div class="notice">Scan error</div>"#;

/// Escape text for use in HTML element content and quoted attributes
pub fn html_escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            c => escaped.push(c),
        }
    }
    escaped
}

fn page(title: &str, head: &str, body: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <title>{title}</title>
    <meta name="viewport" content="width=device-width, initial-scale=1">
    {STYLE}
    {head}
</head>
<body>
    <div class="container">
        <div class="card">
            <div class="logo">PaperDrop</div>
            {body}
        </div>
    </div>
</body>
</html>"#
    )
}

/// Network list entries, or a notice while no scan results are cached
pub fn network_list(networks: &[ScannedNetwork]) -> String {
    if networks.is_empty() {
        return r#"<div class="notice">Scanning... Refresh in 5s</div>"#.to_string();
    }

    networks.iter().fold(String::new(), |mut html, network| {
        let ssid = html_escape(&network.ssid);
        let _ = write!(
            html,
            r#"<div class="network-item" data-ssid="{ssid}" onclick="selectNetwork(this.dataset.ssid)"><span>{ssid}</span><span class="signal">{}</span></div>"#,
            network.strength()
        );
        html
    })
}

/// Setup page with the scanned network list and the password dialog
///
/// # Arguments
/// * `networks` - Pre-rendered network list, see [`network_list`]
/// * `error` - Rejection reason of a previous submission
pub fn setup_page(networks: &str, error: Option<&str>) -> String {
    let error = error
        .map(|reason| format!(r#"<div class="error">{}</div>"#, html_escape(reason)))
        .unwrap_or_default();

    let body = format!(
        r#"<h1>Let's get connected</h1>
            {error}
            <p>Choose your home WiFi so PaperDrop can come online.</p>
            <div class="networks">
                <label>Nearby Networks</label>
                {networks}
            </div>
            <div id="modal-overlay" class="modal-overlay">
                <div class="modal">
                    <button type="button" onclick="closeModal()">Cancel</button>
                    <h3>Connect to <span id="modal-ssid-display"></span></h3>
                    <form action="/connect" method="post">
                        <input type="hidden" id="modal-ssid" name="ssid">
                        <label for="modal-password">Password</label>
                        <input type="password" id="modal-password" name="password" required minlength="8" maxlength="63" placeholder="Enter WiFi Password">
                        <button type="submit">Connect</button>
                    </form>
                </div>
            </div>"#
    );

    page("Setup PaperDrop", SELECT_SCRIPT, &body)
}

/// Page shown after a submission, polls `/status` until the join settles
///
/// # Arguments
/// * `ssid` - Network being joined
/// * `device_code` - Code the user enters on the dashboard to claim the device
/// * `dashboard_url` - Where the claim button leads
pub fn connecting_page(ssid: &str, device_code: &str, dashboard_url: &str) -> String {
    let body = format!(
        r#"<h1 id="status-text">Connecting to {ssid}...</h1>
            <div id="spinner" class="notice">Please wait</div>
            <div id="next-steps" class="hidden">
                <p><strong>Connected!</strong></p>
                <p>1. Copy code: <span class="code">{device_code}</span></p>
                <p>2. Claim your device on the dashboard.</p>
            </div>
            <a id="claim-btn" href="{dashboard_url}" class="btn hidden">Claim Device</a>
            <a id="retry-btn" href="/" class="btn hidden">Try Again</a>"#,
        ssid = html_escape(ssid),
        device_code = html_escape(device_code),
        dashboard_url = html_escape(dashboard_url),
    );

    page("Connecting...", POLL_SCRIPT, &body)
}

/// Plain message page for failures outside the form flow
pub fn message_page(title: &str, message: &str) -> String {
    let body = format!(
        "<h1>{}</h1>\n            <p>{}</p>\n            <a href=\"/\" class=\"btn\">Back</a>",
        html_escape(title),
        html_escape(message)
    );

    page(&html_escape(title), "", &body)
}
