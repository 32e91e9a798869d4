//! Embedded web dashboard
//!
//! A single page for managing containers, networks, volumes, nginx sites,
//! stream forwards and certificates, with a live log viewer fed by the
//! server-sent events route.

use crate::api::PanelBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::Response;

/// Serve the main dashboard HTML
pub fn serve_dashboard() -> Response<PanelBody> {
    asset(DASHBOARD_HTML, "text/html; charset=utf-8")
}

/// Serve dashboard CSS
pub fn serve_css() -> Response<PanelBody> {
    asset(DASHBOARD_CSS, "text/css")
}

/// Serve dashboard JavaScript
pub fn serve_js() -> Response<PanelBody> {
    asset(DASHBOARD_JS, "application/javascript")
}

fn asset(content: &'static str, content_type: &'static str) -> Response<PanelBody> {
    let mut response = Response::new(
        Full::new(Bytes::from_static(content.as_bytes()))
            .map_err(|e| match e {})
            .boxed(),
    );
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

const DASHBOARD_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>Host Panel</title>
    <link rel="stylesheet" href="/dashboard/style.css">
</head>
<body>
    <nav class="navbar">
        <div class="nav-brand">
            <h1>Host Panel</h1>
        </div>
        <div class="nav-links">
            <a href="#" class="nav-link active" data-view="containers">Containers</a>
            <a href="#" class="nav-link" data-view="networks">Networks</a>
            <a href="#" class="nav-link" data-view="volumes">Volumes</a>
            <a href="#" class="nav-link" data-view="sites">Sites</a>
            <a href="#" class="nav-link" data-view="streams">Streams</a>
            <a href="#" class="nav-link" data-view="certificates">Certificates</a>
            <a href="#" class="nav-link" data-view="logs">Logs</a>
        </div>
        <div class="nav-token">
            <input type="password" id="token-input" placeholder="Admin token">
            <button class="btn btn-secondary" onclick="saveToken()">Save</button>
        </div>
    </nav>

    <main class="container">
        <div id="notice" class="notice hidden"></div>

        <!-- Containers -->
        <section id="containers-view" class="view active">
            <div class="view-header">
                <h2>Containers</h2>
                <button class="btn btn-secondary" onclick="refreshContainers()">Refresh</button>
            </div>
            <form id="container-form" class="card form-grid">
                <input name="image" placeholder="Image (nginx:alpine)" required>
                <input name="name" placeholder="Name">
                <input name="ports" placeholder="Ports (8080:80, 5353:53/udp)">
                <input name="volumes" placeholder="Volumes (data:/var/lib/data)">
                <input name="env" placeholder="Env (KEY=value, ...)">
                <input name="network" placeholder="Network">
                <select name="restart">
                    <option value="">No restart</option>
                    <option value="always">always</option>
                    <option value="unless-stopped">unless-stopped</option>
                    <option value="on-failure">on-failure</option>
                </select>
                <button type="submit" class="btn btn-primary">Create</button>
            </form>
            <table class="table">
                <thead>
                    <tr><th>Name</th><th>Image</th><th>State</th><th>Status</th><th>Ports</th><th></th></tr>
                </thead>
                <tbody id="containers-list"></tbody>
            </table>
        </section>

        <!-- Networks -->
        <section id="networks-view" class="view">
            <div class="view-header">
                <h2>Networks</h2>
                <button class="btn btn-secondary" onclick="refreshNetworks()">Refresh</button>
            </div>
            <form id="network-form" class="card form-grid">
                <input name="name" placeholder="Name" required>
                <input name="driver" placeholder="Driver (bridge)">
                <label><input type="checkbox" name="internal"> Internal</label>
                <button type="submit" class="btn btn-primary">Create</button>
            </form>
            <table class="table">
                <thead><tr><th>Name</th><th>Driver</th><th>Scope</th><th></th></tr></thead>
                <tbody id="networks-list"></tbody>
            </table>
        </section>

        <!-- Volumes -->
        <section id="volumes-view" class="view">
            <div class="view-header">
                <h2>Volumes</h2>
                <button class="btn btn-secondary" onclick="refreshVolumes()">Refresh</button>
            </div>
            <form id="volume-form" class="card form-grid">
                <input name="name" placeholder="Name" required>
                <input name="driver" placeholder="Driver (local)">
                <button type="submit" class="btn btn-primary">Create</button>
            </form>
            <table class="table">
                <thead><tr><th>Name</th><th>Driver</th><th>Mountpoint</th><th></th></tr></thead>
                <tbody id="volumes-list"></tbody>
            </table>
        </section>

        <!-- Sites -->
        <section id="sites-view" class="view">
            <div class="view-header">
                <h2>Sites</h2>
                <button class="btn btn-secondary" onclick="refreshSites()">Refresh</button>
            </div>
            <form id="site-form" class="card form-grid">
                <input name="name" placeholder="Name" required>
                <input name="server_names" placeholder="Server names (example.com www.example.com)" required>
                <input name="upstream" placeholder="Upstream (127.0.0.1:3000)" required>
                <input name="certificate" placeholder="Certificate name (optional)">
                <label><input type="checkbox" name="force_https"> Redirect HTTP to HTTPS</label>
                <label><input type="checkbox" name="websocket"> WebSocket</label>
                <button type="submit" class="btn btn-primary">Save</button>
            </form>
            <table class="table">
                <thead><tr><th>Name</th><th>Server names</th><th>Upstream</th><th>TLS</th><th></th></tr></thead>
                <tbody id="sites-list"></tbody>
            </table>
        </section>

        <!-- Streams -->
        <section id="streams-view" class="view">
            <div class="view-header">
                <h2>Streams</h2>
                <button class="btn btn-secondary" onclick="refreshStreams()">Refresh</button>
            </div>
            <form id="stream-form" class="card form-grid">
                <input name="name" placeholder="Name" required>
                <select name="protocol">
                    <option value="tcp">TCP</option>
                    <option value="udp">UDP</option>
                </select>
                <input name="listen_port" type="number" min="1" max="65535" placeholder="Listen port" required>
                <input name="upstream" placeholder="Upstream (10.0.0.5:5432)" required>
                <button type="submit" class="btn btn-primary">Save</button>
            </form>
            <table class="table">
                <thead><tr><th>Name</th><th>Protocol</th><th>Listen</th><th>Upstream</th><th></th></tr></thead>
                <tbody id="streams-list"></tbody>
            </table>
        </section>

        <!-- Certificates -->
        <section id="certificates-view" class="view">
            <div class="view-header">
                <h2>Certificates</h2>
                <button class="btn btn-secondary" onclick="refreshCertificates()">Refresh</button>
            </div>
            <form id="cert-form" class="card form-grid">
                <input name="domains" placeholder="Domains (example.com www.example.com)" required>
                <input name="name" placeholder="Name (optional)">
                <input name="email" placeholder="Contact email (optional)">
                <label><input type="checkbox" name="self_signed"> Self-signed</label>
                <button type="submit" class="btn btn-primary">Issue</button>
            </form>
            <table class="table">
                <thead><tr><th>Name</th><th>Domains</th><th>Issuer</th><th>Expires</th><th></th></tr></thead>
                <tbody id="certificates-list"></tbody>
            </table>
        </section>

        <!-- Logs -->
        <section id="logs-view" class="view">
            <div class="view-header">
                <h2>Logs</h2>
                <div class="log-controls">
                    <select id="logs-container-select">
                        <option value="">Select a container...</option>
                    </select>
                    <button class="btn btn-secondary" onclick="clearLogs()">Clear</button>
                    <button class="btn btn-danger" onclick="stopLogs()">Stop</button>
                </div>
            </div>
            <div class="logs-container">
                <pre id="logs-output">Select a container to follow its logs</pre>
            </div>
        </section>
    </main>

    <script src="/dashboard/app.js"></script>
</body>
</html>
"##;

const DASHBOARD_CSS: &str = r##"
:root {
    --primary: #0ea5e9;
    --primary-dark: #0284c7;
    --success: #10b981;
    --warning: #f59e0b;
    --danger: #ef4444;
    --gray-100: #f3f4f6;
    --gray-200: #e5e7eb;
    --gray-300: #d1d5db;
    --gray-500: #6b7280;
    --gray-700: #374151;
    --gray-800: #1f2937;
    --gray-900: #111827;
}

* {
    box-sizing: border-box;
    margin: 0;
    padding: 0;
}

body {
    font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif;
    background: var(--gray-100);
    color: var(--gray-800);
    line-height: 1.5;
}

.navbar {
    background: var(--gray-900);
    color: white;
    padding: 0 1.5rem;
    height: 60px;
    display: flex;
    align-items: center;
    justify-content: space-between;
    position: sticky;
    top: 0;
    z-index: 100;
}

.nav-brand h1 {
    font-size: 1.25rem;
    font-weight: 600;
}

.nav-links {
    display: flex;
    gap: 0.25rem;
}

.nav-link {
    color: var(--gray-300);
    text-decoration: none;
    padding: 0.5rem 0.75rem;
    border-radius: 0.375rem;
}

.nav-link:hover {
    color: white;
    background: var(--gray-700);
}

.nav-link.active {
    color: white;
    background: var(--primary);
}

.nav-token {
    display: flex;
    gap: 0.5rem;
}

.container {
    max-width: 1200px;
    margin: 0 auto;
    padding: 1.5rem;
}

.view {
    display: none;
}

.view.active {
    display: block;
}

.view-header {
    display: flex;
    justify-content: space-between;
    align-items: center;
    margin-bottom: 1rem;
}

.view-header h2 {
    font-size: 1.5rem;
    font-weight: 600;
}

.card {
    background: white;
    border-radius: 0.5rem;
    padding: 1rem;
    margin-bottom: 1rem;
    box-shadow: 0 1px 3px rgba(0, 0, 0, 0.1);
}

.form-grid {
    display: grid;
    grid-template-columns: repeat(auto-fill, minmax(220px, 1fr));
    gap: 0.75rem;
    align-items: center;
}

input, select {
    padding: 0.5rem;
    border: 1px solid var(--gray-300);
    border-radius: 0.375rem;
    font-size: 0.875rem;
}

.btn {
    padding: 0.5rem 1rem;
    border: none;
    border-radius: 0.375rem;
    font-size: 0.875rem;
    font-weight: 500;
    cursor: pointer;
}

.btn-primary { background: var(--primary); color: white; }
.btn-primary:hover { background: var(--primary-dark); }
.btn-secondary { background: var(--gray-200); color: var(--gray-800); }
.btn-danger { background: var(--danger); color: white; }
.btn-small { padding: 0.25rem 0.5rem; font-size: 0.75rem; }

.table {
    width: 100%;
    background: white;
    border-collapse: collapse;
    border-radius: 0.5rem;
    overflow: hidden;
}

.table th, .table td {
    text-align: left;
    padding: 0.5rem 0.75rem;
    border-bottom: 1px solid var(--gray-200);
    font-size: 0.875rem;
}

.table th {
    background: var(--gray-100);
    color: var(--gray-500);
    font-weight: 500;
}

.actions {
    display: flex;
    gap: 0.25rem;
    justify-content: flex-end;
}

.state-running { color: var(--success); }
.state-exited { color: var(--danger); }
.expiring { color: var(--warning); }

.notice {
    padding: 0.75rem 1rem;
    border-radius: 0.375rem;
    margin-bottom: 1rem;
    background: #fee2e2;
    color: #991b1b;
    white-space: pre-wrap;
}

.notice.ok {
    background: #d1fae5;
    color: #065f46;
}

.hidden {
    display: none;
}

.log-controls {
    display: flex;
    gap: 0.5rem;
}

.logs-container {
    background: var(--gray-900);
    border-radius: 0.5rem;
    padding: 1rem;
    height: 70vh;
    overflow-y: auto;
}

#logs-output {
    color: #e5e7eb;
    font-family: 'SF Mono', Menlo, Monaco, monospace;
    font-size: 0.8rem;
    white-space: pre-wrap;
    word-break: break-all;
}

#logs-output .log-error {
    color: var(--danger);
}

#logs-output .log-end {
    color: var(--gray-500);
}
"##;

const DASHBOARD_JS: &str = r##"
// API Configuration
let apiToken = localStorage.getItem('panel_token') || '';
let logSource = null;
let reconnectTimer = null;

const RECONNECT_DELAY_MS = 3000;

document.addEventListener('DOMContentLoaded', () => {
    document.getElementById('token-input').value = apiToken;
    setupNavigation();
    setupForms();
    document.getElementById('logs-container-select').addEventListener('change', (e) => {
        followLogs(e.target.value);
    });
    refreshContainers();
});

function saveToken() {
    apiToken = document.getElementById('token-input').value.trim();
    localStorage.setItem('panel_token', apiToken);
    refreshContainers();
}

// Navigation
function setupNavigation() {
    document.querySelectorAll('.nav-link').forEach(link => {
        link.addEventListener('click', (e) => {
            e.preventDefault();
            showView(link.dataset.view);
            document.querySelectorAll('.nav-link').forEach(l => l.classList.remove('active'));
            link.classList.add('active');
        });
    });
}

const refreshers = {
    containers: () => refreshContainers(),
    networks: () => refreshNetworks(),
    volumes: () => refreshVolumes(),
    sites: () => refreshSites(),
    streams: () => refreshStreams(),
    certificates: () => refreshCertificates(),
    logs: () => populateLogsSelect(),
};

function showView(viewName) {
    document.querySelectorAll('.view').forEach(v => v.classList.remove('active'));
    const view = document.getElementById(`${viewName}-view`);
    if (view) {
        view.classList.add('active');
    }
    if (viewName !== 'logs') {
        stopLogs();
    }
    const refresh = refreshers[viewName];
    if (refresh) {
        refresh();
    }
}

// API Helpers
async function apiRequest(method, path, body = null) {
    const options = {
        method,
        headers: {
            'Authorization': `Bearer ${apiToken}`,
            'Content-Type': 'application/json'
        }
    };
    if (body) {
        options.body = JSON.stringify(body);
    }

    const response = await fetch(path, options);
    const data = await response.json();
    if (!data.success) {
        throw new Error(data.error || 'API request failed');
    }
    return data.data;
}

function notify(message, ok = false) {
    const notice = document.getElementById('notice');
    notice.textContent = message;
    notice.classList.toggle('ok', ok);
    notice.classList.remove('hidden');
    setTimeout(() => notice.classList.add('hidden'), 6000);
}

async function action(promise, success, refresh) {
    try {
        await promise;
        notify(success, true);
    } catch (e) {
        notify(e.message);
    }
    if (refresh) {
        refresh();
    }
}

function escapeHtml(text) {
    const div = document.createElement('div');
    div.textContent = text == null ? '' : String(text);
    return div.innerHTML;
}

function splitList(value) {
    return value.split(/[\s,]+/).map(v => v.trim()).filter(Boolean);
}

function renderRows(tbodyId, items, columns, emptyText) {
    const tbody = document.getElementById(tbodyId);
    if (!items || items.length === 0) {
        tbody.innerHTML = `<tr><td colspan="${columns + 1}">${emptyText}</td></tr>`;
        return null;
    }
    return tbody;
}

// Containers
async function refreshContainers() {
    try {
        const containers = await apiRequest('GET', '/api/containers');
        const tbody = renderRows('containers-list', containers, 5, 'No containers');
        if (!tbody) return;
        tbody.innerHTML = containers.map(c => `
            <tr>
                <td>${escapeHtml(c.name)}</td>
                <td>${escapeHtml(c.image)}</td>
                <td class="state-${escapeHtml(c.state)}">${escapeHtml(c.state)}</td>
                <td>${escapeHtml(c.status)}</td>
                <td>${escapeHtml((c.ports || []).join(', '))}</td>
                <td class="actions">
                    <button class="btn btn-small btn-secondary" onclick="containerAction('${c.id}', 'start')">Start</button>
                    <button class="btn btn-small btn-secondary" onclick="containerAction('${c.id}', 'stop')">Stop</button>
                    <button class="btn btn-small btn-secondary" onclick="containerAction('${c.id}', 'restart')">Restart</button>
                    <button class="btn btn-small btn-secondary" onclick="showLogs('${c.id}')">Logs</button>
                    <button class="btn btn-small btn-danger" onclick="removeContainer('${c.id}')">Remove</button>
                </td>
            </tr>
        `).join('');
    } catch (e) {
        renderRows('containers-list', [], 5, escapeHtml(e.message));
    }
}

function containerAction(id, verb) {
    action(apiRequest('POST', `/api/containers/${id}/${verb}`), `Container ${verb} requested`, refreshContainers);
}

function removeContainer(id) {
    if (!confirm('Remove this container?')) return;
    action(apiRequest('DELETE', `/api/containers/${id}`), 'Container removed', refreshContainers);
}

// Networks
async function refreshNetworks() {
    try {
        const networks = await apiRequest('GET', '/api/networks');
        const tbody = renderRows('networks-list', networks, 3, 'No networks');
        if (!tbody) return;
        tbody.innerHTML = networks.map(n => `
            <tr>
                <td>${escapeHtml(n.Name)}</td>
                <td>${escapeHtml(n.Driver)}</td>
                <td>${escapeHtml(n.Scope)}</td>
                <td class="actions">
                    <button class="btn btn-small btn-danger" onclick="removeNetwork('${escapeHtml(n.Name)}')">Remove</button>
                </td>
            </tr>
        `).join('');
    } catch (e) {
        renderRows('networks-list', [], 3, escapeHtml(e.message));
    }
}

function removeNetwork(name) {
    if (!confirm(`Remove network ${name}?`)) return;
    action(apiRequest('DELETE', `/api/networks/${encodeURIComponent(name)}`), 'Network removed', refreshNetworks);
}

// Volumes
async function refreshVolumes() {
    try {
        const volumes = await apiRequest('GET', '/api/volumes');
        const tbody = renderRows('volumes-list', volumes, 3, 'No volumes');
        if (!tbody) return;
        tbody.innerHTML = volumes.map(v => `
            <tr>
                <td>${escapeHtml(v.Name)}</td>
                <td>${escapeHtml(v.Driver)}</td>
                <td>${escapeHtml(v.Mountpoint)}</td>
                <td class="actions">
                    <button class="btn btn-small btn-danger" onclick="removeVolume('${escapeHtml(v.Name)}')">Remove</button>
                </td>
            </tr>
        `).join('');
    } catch (e) {
        renderRows('volumes-list', [], 3, escapeHtml(e.message));
    }
}

function removeVolume(name) {
    if (!confirm(`Remove volume ${name}?`)) return;
    action(apiRequest('DELETE', `/api/volumes/${encodeURIComponent(name)}`), 'Volume removed', refreshVolumes);
}

// Sites
async function refreshSites() {
    try {
        const sites = await apiRequest('GET', '/api/sites');
        const tbody = renderRows('sites-list', sites, 4, 'No sites');
        if (!tbody) return;
        tbody.innerHTML = sites.map(s => `
            <tr>
                <td>${escapeHtml(s.name)}</td>
                <td>${escapeHtml(s.server_names.join(' '))}</td>
                <td>${escapeHtml(s.upstream)}</td>
                <td>${s.tls ? escapeHtml(s.tls.certificate) : '-'}</td>
                <td class="actions">
                    <button class="btn btn-small btn-danger" onclick="removeSite('${escapeHtml(s.name)}')">Remove</button>
                </td>
            </tr>
        `).join('');
    } catch (e) {
        renderRows('sites-list', [], 4, escapeHtml(e.message));
    }
}

function removeSite(name) {
    if (!confirm(`Remove site ${name}?`)) return;
    action(apiRequest('DELETE', `/api/sites/${encodeURIComponent(name)}`), 'Site removed', refreshSites);
}

// Streams
async function refreshStreams() {
    try {
        const streams = await apiRequest('GET', '/api/streams');
        const tbody = renderRows('streams-list', streams, 4, 'No streams');
        if (!tbody) return;
        tbody.innerHTML = streams.map(s => `
            <tr>
                <td>${escapeHtml(s.name)}</td>
                <td>${escapeHtml(s.protocol)}</td>
                <td>${s.listen_port}</td>
                <td>${escapeHtml(s.upstream)}</td>
                <td class="actions">
                    <button class="btn btn-small btn-danger" onclick="removeStream('${escapeHtml(s.name)}')">Remove</button>
                </td>
            </tr>
        `).join('');
    } catch (e) {
        renderRows('streams-list', [], 4, escapeHtml(e.message));
    }
}

function removeStream(name) {
    if (!confirm(`Remove stream ${name}?`)) return;
    action(apiRequest('DELETE', `/api/streams/${encodeURIComponent(name)}`), 'Stream removed', refreshStreams);
}

// Certificates
async function refreshCertificates() {
    try {
        const certs = await apiRequest('GET', '/api/certificates');
        const tbody = renderRows('certificates-list', certs, 4, 'No certificates');
        if (!tbody) return;
        tbody.innerHTML = certs.map(c => `
            <tr>
                <td>${escapeHtml(c.name)}${c.self_signed ? ' (self-signed)' : ''}</td>
                <td>${escapeHtml(c.domains.join(' '))}</td>
                <td>${escapeHtml(c.issuer)}</td>
                <td class="${c.days_remaining < 14 ? 'expiring' : ''}">${c.days_remaining} days</td>
                <td class="actions">
                    <button class="btn btn-small btn-danger" onclick="deleteCertificate('${escapeHtml(c.name)}')">Delete</button>
                </td>
            </tr>
        `).join('');
    } catch (e) {
        renderRows('certificates-list', [], 4, escapeHtml(e.message));
    }
}

function deleteCertificate(name) {
    if (!confirm(`Delete certificate ${name}?`)) return;
    action(apiRequest('DELETE', `/api/certificates/${encodeURIComponent(name)}`), 'Certificate deleted', refreshCertificates);
}

// Forms
function setupForms() {
    document.getElementById('container-form').addEventListener('submit', (e) => {
        e.preventDefault();
        const f = e.target;
        const body = {
            image: f.image.value.trim(),
            name: f.name.value.trim() || null,
            ports: splitList(f.ports.value),
            volumes: splitList(f.volumes.value),
            env: splitList(f.env.value),
            network: f.network.value.trim() || null,
            restart: f.restart.value || null,
        };
        action(apiRequest('POST', '/api/containers', body), 'Container created', refreshContainers);
        f.reset();
    });

    document.getElementById('network-form').addEventListener('submit', (e) => {
        e.preventDefault();
        const f = e.target;
        const body = {
            name: f.name.value.trim(),
            driver: f.driver.value.trim() || null,
            internal: f.internal.checked,
        };
        action(apiRequest('POST', '/api/networks', body), 'Network created', refreshNetworks);
        f.reset();
    });

    document.getElementById('volume-form').addEventListener('submit', (e) => {
        e.preventDefault();
        const f = e.target;
        const body = { name: f.name.value.trim(), driver: f.driver.value.trim() || null };
        action(apiRequest('POST', '/api/volumes', body), 'Volume created', refreshVolumes);
        f.reset();
    });

    document.getElementById('site-form').addEventListener('submit', (e) => {
        e.preventDefault();
        const f = e.target;
        const certificate = f.certificate.value.trim();
        const body = {
            name: f.name.value.trim(),
            server_names: splitList(f.server_names.value),
            upstream: f.upstream.value.trim(),
            websocket: f.websocket.checked,
            tls: certificate ? { certificate, force_https: f.force_https.checked } : null,
        };
        action(apiRequest('POST', '/api/sites', body), 'Site saved and nginx reloaded', refreshSites);
    });

    document.getElementById('stream-form').addEventListener('submit', (e) => {
        e.preventDefault();
        const f = e.target;
        const body = {
            name: f.name.value.trim(),
            protocol: f.protocol.value,
            listen_port: parseInt(f.listen_port.value, 10),
            upstream: f.upstream.value.trim(),
        };
        action(apiRequest('POST', '/api/streams', body), 'Stream saved and nginx reloaded', refreshStreams);
    });

    document.getElementById('cert-form').addEventListener('submit', (e) => {
        e.preventDefault();
        const f = e.target;
        const body = {
            domains: splitList(f.domains.value),
            name: f.name.value.trim() || null,
            email: f.email.value.trim() || null,
            self_signed: f.self_signed.checked,
        };
        action(apiRequest('POST', '/api/certificates', body), 'Certificate issued', refreshCertificates);
    });
}

// Logs
async function populateLogsSelect() {
    const select = document.getElementById('logs-container-select');
    try {
        const containers = await apiRequest('GET', '/api/containers');
        const current = select.value;
        select.innerHTML = '<option value="">Select a container...</option>' +
            containers.map(c => `<option value="${c.id}">${escapeHtml(c.name)}</option>`).join('');
        select.value = current;
    } catch (e) {
        notify(e.message);
    }
}

function showLogs(id) {
    document.querySelectorAll('.nav-link').forEach(l => {
        l.classList.toggle('active', l.dataset.view === 'logs');
    });
    showView('logs');
    document.getElementById('logs-container-select').value = id;
    followLogs(id);
}

function appendLog(text, cls) {
    const output = document.getElementById('logs-output');
    const line = document.createElement('span');
    if (cls) {
        line.className = cls;
    }
    line.textContent = text.endsWith('\n') ? text : text + '\n';
    output.appendChild(line);
    const box = output.parentElement;
    box.scrollTop = box.scrollHeight;
}

function followLogs(id) {
    stopLogs();
    const output = document.getElementById('logs-output');
    output.textContent = '';
    if (!id) {
        output.textContent = 'Select a container to follow its logs';
        return;
    }
    openLogSource(id);
}

function openLogSource(id) {
    const url = `/api/containers/${encodeURIComponent(id)}/logs?token=${encodeURIComponent(apiToken)}`;
    logSource = new EventSource(url);

    logSource.onmessage = (e) => {
        appendLog(JSON.parse(e.data).text);
    };

    // A finished stream stays finished; only transport errors reconnect
    logSource.addEventListener('end', (e) => {
        appendLog(JSON.parse(e.data).text, 'log-end');
        logSource.close();
        logSource = null;
    });

    // Fires for server-sent `error` events (with data) and for transport errors
    logSource.onerror = (e) => {
        if (e.data) {
            appendLog(JSON.parse(e.data).error, 'log-error');
        }
        if (!logSource) return;
        logSource.close();
        logSource = null;
        reconnectTimer = setTimeout(() => {
            reconnectTimer = null;
            openLogSource(id);
        }, RECONNECT_DELAY_MS);
    };
}

function stopLogs() {
    if (reconnectTimer) {
        clearTimeout(reconnectTimer);
        reconnectTimer = null;
    }
    if (logSource) {
        logSource.close();
        logSource = null;
    }
}

function clearLogs() {
    document.getElementById('logs-output').textContent = '';
}
"##;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_types() {
        let cases = [
            (serve_dashboard(), "text/html; charset=utf-8"),
            (serve_css(), "text/css"),
            (serve_js(), "application/javascript"),
        ];
        for (response, expected) in cases {
            assert_eq!(response.status(), hyper::StatusCode::OK);
            assert_eq!(response.headers().get(CONTENT_TYPE).unwrap(), expected);
        }
    }

    #[test]
    fn test_dashboard_references_assets() {
        assert!(DASHBOARD_HTML.contains("/dashboard/style.css"));
        assert!(DASHBOARD_HTML.contains("/dashboard/app.js"));
        for view in ["containers", "networks", "volumes", "sites", "streams", "certificates", "logs"] {
            assert!(DASHBOARD_HTML.contains(&format!("id=\"{}-view\"", view)));
        }
    }

    #[test]
    fn test_log_viewer_reconnects() {
        assert!(DASHBOARD_JS.contains("new EventSource"));
        assert!(DASHBOARD_JS.contains("RECONNECT_DELAY_MS = 3000"));
        assert!(DASHBOARD_JS.contains("addEventListener('end'"));
    }

    #[test]
    fn test_log_viewer_does_not_reconnect_after_end() {
        let end_listener = DASHBOARD_JS
            .split("addEventListener('end'")
            .nth(1)
            .and_then(|rest| rest.split("});").next())
            .unwrap();
        assert!(end_listener.contains("logSource.close()"));
        assert!(end_listener.contains("logSource = null"));
        assert!(!end_listener.contains("setTimeout"));

        let error_handler = DASHBOARD_JS.split("logSource.onerror").nth(1).unwrap();
        let early_return = error_handler.find("if (!logSource) return;").unwrap();
        let reconnect = error_handler.find("setTimeout").unwrap();
        assert!(early_return < reconnect);
    }

    #[tokio::test]
    async fn test_js_body() {
        let body = serve_js().into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, Bytes::from_static(DASHBOARD_JS.as_bytes()));
    }
}
