use std::sync::mpsc::{self, Receiver, Sender};
use std::time::Duration;

use chrono::Utc;
use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use ratatui::layout::{Constraint, Layout, Rect};
use ratatui::style::{Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::Paragraph;
use ratatui::Frame;
use tracing::{debug, info};

use super::ledgers::{alcabala_columns, fetch_document, DocumentOutcome};
use super::search::NO_INFORMATION;
use crate::aggregate::{
    aggregate_receipts, apply_status, declaration_totals, filter_declarations_by_year, group_users,
    next_status, receipts_grand_total, summarize_search, vehicle_totals, ReceiptFilter,
    ReceiptGroupSummary,
};
use crate::api::search::validate_document_number;
use crate::api::ApiClient;
use crate::drilldown::{Drilldown, Expanded, LoadState, RowTicket, Ticket};
use crate::error::{ConsultaError, Result};
use crate::fmt::{date, datetime, money, truncate, yes_no};
use crate::guard::{authorize, Access, Route};
use crate::models::{
    Alcabala, CadastralDocument, Declaration, ManagedUser, ReceiptGroup, Session, TaxpayerMatch,
    VehicleTax,
};
use crate::normalize::lenient::text_of;
use crate::normalize::Ident;
use crate::report::{alcabala_report, declaration_report};
use crate::session::{FileStore, SessionStore};
use crate::settings::{load_settings, Settings};
use crate::tui::{
    chrome, footer_line, install_panic_hook, money_span, scroll_offset, wrap_text, CLEAR_STYLE,
    DEBT_STYLE, ERROR_STYLE, HEADER_STYLE, MUTED_STYLE, NOTICE_STYLE, SELECTED_STYLE,
};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

const MAX_DOCUMENT_LEN: usize = 11;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Ledger {
    Declarations,
    Receipts,
    Vehicles,
    Cadastral,
    Alcabala,
}

const LEDGERS: [Ledger; 5] = [
    Ledger::Declarations,
    Ledger::Receipts,
    Ledger::Vehicles,
    Ledger::Cadastral,
    Ledger::Alcabala,
];

impl Ledger {
    fn title(self) -> &'static str {
        match self {
            Ledger::Declarations => "Sworn declarations (DDJJ)",
            Ledger::Receipts => "Cashier receipts",
            Ledger::Vehicles => "Vehicle tax",
            Ledger::Cadastral => "Cadastral documents",
            Ledger::Alcabala => "Property transfer tax (alcabala)",
        }
    }
}

/// Worker results. Each carries the ticket it was issued with.
enum Message {
    Search(Ticket, Result<Vec<TaxpayerMatch>>),
    Declarations(Ticket, Result<Vec<Declaration>>),
    Receipts(Ticket, Result<Vec<ReceiptGroup>>),
    Vehicles(Ticket, Result<Vec<VehicleTax>>),
    Cadastral(Ticket, Result<Vec<CadastralDocument>>),
    Alcabala(Ticket, Result<Vec<Alcabala>>),
    Users(Ticket, Result<Vec<ManagedUser>>),
    Document(RowTicket, Result<DocumentOutcome>),
    Toggle(RowTicket, Ident, Result<bool>),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Screen {
    Search,
    Menu,
    Ledger(Ledger),
    Users,
}

/// Which text field keystrokes currently go to.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Input {
    Document,
    EntityFilter,
    Year,
    ReceiptNumber,
    ReceiptMemo,
    None,
}

#[derive(Default)]
struct Cursor {
    selection: usize,
    offset: usize,
}

impl Cursor {
    fn up(&mut self) {
        self.selection = self.selection.saturating_sub(1);
    }

    fn down(&mut self, len: usize) {
        if self.selection + 1 < len {
            self.selection += 1;
        }
    }

    fn clamp(&mut self, len: usize) {
        if len == 0 {
            self.selection = 0;
        } else if self.selection >= len {
            self.selection = len - 1;
        }
    }

    fn reset(&mut self) {
        self.selection = 0;
        self.offset = 0;
    }
}

/// One visible line of the receipts tree.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum TreeRow {
    Group(usize),
    Receipt(usize, usize),
    Item(usize, usize, usize),
}

struct Dashboard {
    settings: Settings,
    store: SessionStore<FileStore>,
    session: Session,
    client: ApiClient,
    tx: Sender<Message>,

    screen: Screen,
    input: Input,
    notice: Option<String>,
    error: Option<String>,
    quit: bool,
    exit_message: Option<String>,

    document: String,
    search: Drilldown<Vec<TaxpayerMatch>>,
    entity_filter: String,
    results: Cursor,
    selected_match: Option<TaxpayerMatch>,
    menu: Cursor,

    rows: Cursor,
    year_filter: String,
    receipt_filter: ReceiptFilter,
    expanded: Expanded,
    declarations: Drilldown<Vec<Declaration>>,
    receipts: Drilldown<Vec<ReceiptGroup>>,
    vehicles: Drilldown<Vec<VehicleTax>>,
    cadastral: Drilldown<Vec<CadastralDocument>>,
    alcabala: Drilldown<Vec<Alcabala>>,
    users: Drilldown<Vec<ManagedUser>>,
}

impl Dashboard {
    fn new(
        settings: Settings,
        store: SessionStore<FileStore>,
        session: Session,
        tx: Sender<Message>,
    ) -> Result<Self> {
        let client = ApiClient::new(&settings, Some(session.token.clone()))?;
        Ok(Self {
            settings,
            store,
            session,
            client,
            tx,
            screen: Screen::Search,
            input: Input::Document,
            notice: None,
            error: None,
            quit: false,
            exit_message: None,
            document: String::new(),
            search: Drilldown::new(),
            entity_filter: String::new(),
            results: Cursor::default(),
            selected_match: None,
            menu: Cursor::default(),
            rows: Cursor::default(),
            year_filter: String::new(),
            receipt_filter: ReceiptFilter::default(),
            expanded: Expanded::default(),
            declarations: Drilldown::new(),
            receipts: Drilldown::new(),
            vehicles: Drilldown::new(),
            cadastral: Drilldown::new(),
            alcabala: Drilldown::new(),
            users: Drilldown::new(),
        })
    }

    fn spawn<F>(&self, job: F)
    where
        F: FnOnce() -> Message + Send + 'static,
    {
        let tx = self.tx.clone();
        std::thread::spawn(move || {
            // The dashboard may have exited; nobody is listening then.
            let _ = tx.send(job());
        });
    }

    // -- navigation -------------------------------------------------------

    /// Re-run the guard against the stored session before every screen change.
    fn go(&mut self, screen: Screen) -> bool {
        let route = match screen {
            Screen::Users => Route::AdminUsers,
            _ => Route::Dashboard,
        };
        match authorize(&self.store, &route) {
            Access::Authenticated(session) => {
                if session.token != self.session.token {
                    match ApiClient::new(&self.settings, Some(session.token.clone())) {
                        Ok(client) => self.client = client,
                        Err(e) => {
                            self.error = Some(e.to_string());
                            return false;
                        }
                    }
                }
                self.session = session;
                self.screen = screen;
                self.notice = None;
                self.error = None;
                debug!(?screen, "screen change");
                true
            }
            Access::Redirect(Route::Dashboard) => {
                self.error = Some("Administrator access required.".to_string());
                false
            }
            Access::Redirect(_) | Access::Public => {
                info!("session gone; leaving dashboard");
                self.exit_message =
                    Some("Your session has ended. Run `consulta login` to continue.".to_string());
                self.quit = true;
                false
            }
        }
    }

    fn leave_ledger(&mut self, ledger: Ledger) {
        match ledger {
            Ledger::Declarations => self.declarations.close(),
            Ledger::Receipts => self.receipts.close(),
            Ledger::Vehicles => self.vehicles.close(),
            Ledger::Cadastral => self.cadastral.close(),
            Ledger::Alcabala => self.alcabala.close(),
        }
        self.expanded.clear();
        self.input = Input::None;
        self.go(Screen::Menu);
    }

    // -- requests ---------------------------------------------------------

    fn submit_search(&mut self) {
        match validate_document_number(&self.document) {
            Err(e) => self.error = Some(e.to_string()),
            Ok(doc) => {
                self.error = None;
                self.notice = None;
                self.entity_filter.clear();
                self.results.reset();
                let ticket = self.search.open();
                let client = self.client.clone();
                self.spawn(move || Message::Search(ticket, client.search_by_document(&doc)));
            }
        }
    }

    fn enter_ledger(&mut self, ledger: Ledger) {
        if !self.go(Screen::Ledger(ledger)) {
            return;
        }
        self.rows.reset();
        self.expanded.clear();
        self.year_filter.clear();
        self.receipt_filter = ReceiptFilter::default();
        self.input = Input::None;
        self.fetch_ledger(ledger);
    }

    /// Open (or refresh) a ledger view. Earlier results are discarded.
    fn fetch_ledger(&mut self, ledger: Ledger) {
        let Some(conn) = self.selected_match.as_ref().map(TaxpayerMatch::connection) else {
            return;
        };
        let client = self.client.clone();
        match ledger {
            Ledger::Declarations => {
                let t = self.declarations.open();
                self.spawn(move || Message::Declarations(t, client.list_declarations(&conn)));
            }
            Ledger::Receipts => {
                let year = self.year_filter.trim().parse::<i32>().ok();
                let t = self.receipts.open();
                self.expanded.clear();
                self.spawn(move || Message::Receipts(t, client.list_receipts(&conn, year)));
            }
            Ledger::Vehicles => {
                let t = self.vehicles.open();
                self.spawn(move || Message::Vehicles(t, client.list_vehicle_taxes(&conn)));
            }
            Ledger::Cadastral => {
                let t = self.cadastral.open();
                self.spawn(move || {
                    Message::Cadastral(t, client.list_cadastral_documents(&conn))
                });
            }
            Ledger::Alcabala => {
                let t = self.alcabala.open();
                self.spawn(move || Message::Alcabala(t, client.list_alcabala(&conn)));
            }
        }
    }

    fn enter_users(&mut self) {
        if !self.go(Screen::Users) {
            return;
        }
        self.rows.reset();
        self.fetch_users();
    }

    fn fetch_users(&mut self) {
        let client = self.client.clone();
        let t = self.users.open();
        self.spawn(move || Message::Users(t, client.list_users()));
    }

    fn fetch_document_row(&mut self) {
        let row = self.rows.selection;
        let Some(doc) = self.cadastral.data().and_then(|d| d.get(row)).cloned() else {
            return;
        };
        let Some(ticket) = self.cadastral.begin_row(row) else {
            self.notice = Some("That document is already being fetched.".to_string());
            return;
        };
        let client = self.client.clone();
        let settings = self.settings.clone();
        self.spawn(move || Message::Document(ticket, fetch_document(&client, &settings, &doc)));
    }

    fn toggle_selected_user(&mut self) {
        let Some(users) = self.users.data() else {
            return;
        };
        let ordered = ordered_users(users);
        let Some(user) = ordered.get(self.rows.selection).map(|(_, u)| u.clone()) else {
            return;
        };
        if let Err(e) = next_status(users, &user.id) {
            self.error = Some(e.to_string());
            return;
        }
        let snapshot = users.clone();
        let Some(ticket) = self.users.begin_row(self.rows.selection) else {
            return;
        };
        let client = self.client.clone();
        let id = user.id.clone();
        self.spawn(move || {
            let result = client.toggle_user_status(&snapshot, &id);
            Message::Toggle(ticket, id, result)
        });
    }

    fn apply(&mut self, msg: Message) {
        match msg {
            Message::Search(t, result) => {
                let found = result.as_ref().map(|r| !r.is_empty()).unwrap_or(false);
                if self.search.commit(t, result) && found {
                    self.input = Input::None;
                }
            }
            Message::Declarations(t, r) => {
                self.declarations.commit(t, r);
            }
            Message::Receipts(t, r) => {
                self.receipts.commit(t, r);
            }
            Message::Vehicles(t, r) => {
                self.vehicles.commit(t, r);
            }
            Message::Cadastral(t, r) => {
                self.cadastral.commit(t, r);
            }
            Message::Alcabala(t, r) => {
                self.alcabala.commit(t, r);
            }
            Message::Users(t, r) => {
                self.users.commit(t, r);
            }
            Message::Document(ticket, result) => {
                let row_error = result.as_ref().err().map(|e| e.to_string());
                if !self.cadastral.finish_row(ticket, row_error) {
                    return;
                }
                match result {
                    Ok(DocumentOutcome::Signed { url, signature }) => {
                        let sig = signature
                            .map(|s| format!("  Signature: {}", truncate(&s.to_string(), 80)))
                            .unwrap_or_default();
                        self.notice = Some(format!("Signed document: {url}{sig}"));
                    }
                    Ok(DocumentOutcome::Saved { path }) => {
                        self.notice = Some(format!("Saved {}", path.display()));
                    }
                    Err(e) => self.error = Some(e.to_string()),
                }
            }
            Message::Toggle(ticket, id, result) => {
                let row_error = result.as_ref().err().map(|e| e.to_string());
                if !self.users.finish_row(ticket, row_error) {
                    return;
                }
                match result {
                    Ok(active) => {
                        if let Some(list) = self.users.data_mut() {
                            apply_status(list, &id, active);
                        }
                        self.notice = Some(if active {
                            "User activated.".to_string()
                        } else {
                            "User deactivated.".to_string()
                        });
                    }
                    Err(e) => self.error = Some(e.to_string()),
                }
            }
        }
    }

    // -- keys -------------------------------------------------------------

    fn handle_key(&mut self, code: KeyCode) {
        if self.input != Input::None && self.handle_text(code) {
            return;
        }
        match self.screen {
            Screen::Search => self.handle_search_key(code),
            Screen::Menu => self.handle_menu_key(code),
            Screen::Ledger(ledger) => self.handle_ledger_key(ledger, code),
            Screen::Users => self.handle_users_key(code),
        }
    }

    /// Text entry. Returns true if the key was consumed.
    fn handle_text(&mut self, code: KeyCode) -> bool {
        let target = self.input;
        let field = match target {
            Input::Document => &mut self.document,
            Input::EntityFilter => &mut self.entity_filter,
            Input::Year => &mut self.year_filter,
            Input::ReceiptNumber => &mut self.receipt_filter.number,
            Input::ReceiptMemo => &mut self.receipt_filter.memo,
            Input::None => return false,
        };
        match code {
            KeyCode::Char(c) => {
                let accepted = match target {
                    Input::Document => c.is_ascii_digit() && field.len() < MAX_DOCUMENT_LEN,
                    Input::Year => c.is_ascii_digit() && field.len() < 4,
                    _ => true,
                };
                if accepted {
                    field.push(c);
                    self.error = None;
                }
            }
            KeyCode::Backspace => {
                field.pop();
            }
            KeyCode::Enter => match target {
                Input::Document => self.submit_search(),
                Input::Year if self.screen == Screen::Ledger(Ledger::Receipts) => {
                    self.input = Input::None;
                    self.fetch_ledger(Ledger::Receipts);
                }
                _ => self.input = Input::None,
            },
            KeyCode::Esc => {
                if target == Input::Document {
                    if self.search.data().map(|d| !d.is_empty()).unwrap_or(false) {
                        self.input = Input::None;
                    } else {
                        self.quit = true;
                    }
                } else {
                    field.clear();
                    self.input = Input::None;
                }
            }
            KeyCode::Tab if target == Input::Document => {
                if self.search.data().is_some() {
                    self.input = Input::None;
                }
            }
            _ => return false,
        }
        self.results.clamp(self.visible_matches().len());
        true
    }

    fn handle_search_key(&mut self, code: KeyCode) {
        let len = self.visible_matches().len();
        match code {
            KeyCode::Char('q') | KeyCode::Esc => self.quit = true,
            KeyCode::Up => self.results.up(),
            KeyCode::Down => self.results.down(len),
            KeyCode::Char('/') => self.input = Input::EntityFilter,
            KeyCode::Tab | KeyCode::Char('s') => self.input = Input::Document,
            KeyCode::Char('r') => self.submit_search(),
            KeyCode::Char('u') => self.enter_users(),
            KeyCode::Enter => {
                if let Some(m) = self.visible_matches().get(self.results.selection).cloned() {
                    self.selected_match = Some(m);
                    self.menu.reset();
                    self.go(Screen::Menu);
                }
            }
            _ => {}
        }
    }

    fn handle_menu_key(&mut self, code: KeyCode) {
        match code {
            KeyCode::Esc | KeyCode::Char('q') | KeyCode::Left => {
                self.go(Screen::Search);
            }
            KeyCode::Up => self.menu.up(),
            KeyCode::Down => self.menu.down(LEDGERS.len()),
            KeyCode::Char(c @ '1'..='5') => {
                let idx = c as usize - '1' as usize;
                self.menu.selection = idx;
                self.enter_ledger(LEDGERS[idx]);
            }
            KeyCode::Enter => self.enter_ledger(LEDGERS[self.menu.selection]),
            _ => {}
        }
    }

    fn handle_ledger_key(&mut self, ledger: Ledger, code: KeyCode) {
        let len = self.ledger_len(ledger);
        match code {
            KeyCode::Esc | KeyCode::Char('q') | KeyCode::Left => self.leave_ledger(ledger),
            KeyCode::Up => self.rows.up(),
            KeyCode::Down => self.rows.down(len),
            KeyCode::Char('r') => {
                self.rows.reset();
                self.fetch_ledger(ledger);
            }
            KeyCode::Char('y') if matches!(ledger, Ledger::Declarations | Ledger::Receipts) => {
                self.input = Input::Year;
            }
            KeyCode::Char('n') if ledger == Ledger::Receipts => self.input = Input::ReceiptNumber,
            KeyCode::Char('m') if ledger == Ledger::Receipts => self.input = Input::ReceiptMemo,
            KeyCode::Enter => match ledger {
                Ledger::Declarations => self.show_declaration_report(),
                Ledger::Alcabala => self.show_alcabala_report(),
                Ledger::Receipts => self.toggle_tree_row(),
                Ledger::Cadastral => self.fetch_document_row(),
                Ledger::Vehicles => {}
            },
            _ => {}
        }
    }

    fn handle_users_key(&mut self, code: KeyCode) {
        let len = self.users.data().map(Vec::len).unwrap_or(0);
        match code {
            KeyCode::Esc | KeyCode::Char('q') | KeyCode::Left => {
                self.users.close();
                self.go(Screen::Search);
            }
            KeyCode::Up => self.rows.up(),
            KeyCode::Down => self.rows.down(len),
            KeyCode::Char('r') => self.fetch_users(),
            KeyCode::Enter | KeyCode::Char('t') => self.toggle_selected_user(),
            _ => {}
        }
    }

    fn show_declaration_report(&mut self) {
        let rows = self.filtered_declarations();
        let Some(decl) = rows.get(self.rows.selection) else {
            return;
        };
        let bde = self.selected_match.as_ref().and_then(|m| m.external_db_id.as_ref());
        match declaration_report(&self.settings.report_base_url, decl, bde, &self.session.token) {
            Ok(url) => self.notice = Some(url),
            Err(e) => self.error = Some(e.to_string()),
        }
    }

    fn show_alcabala_report(&mut self) {
        let Some(row) = self.alcabala.data().and_then(|d| d.get(self.rows.selection)) else {
            return;
        };
        let bde = self.selected_match.as_ref().and_then(|m| m.external_db_id.as_ref());
        match alcabala_report(&self.settings.report_base_url, row, bde, &self.session.token) {
            Ok(url) => self.notice = Some(url),
            Err(e) => self.error = Some(e.to_string()),
        }
    }

    fn toggle_tree_row(&mut self) {
        let groups = self.receipt_summary();
        let rows = tree_rows(&groups, &self.expanded);
        match rows.get(self.rows.selection) {
            Some(TreeRow::Group(g)) => {
                self.expanded.toggle(&group_key(&groups[*g], *g));
            }
            Some(TreeRow::Receipt(g, r)) => {
                self.expanded.toggle(&receipt_key(&groups[*g], *g, *r));
            }
            _ => {}
        }
    }

    // -- derived data -----------------------------------------------------

    fn visible_matches(&self) -> Vec<TaxpayerMatch> {
        self.search
            .data()
            .map(|m| summarize_search(m, &self.entity_filter).rows)
            .unwrap_or_default()
    }

    fn filtered_declarations(&self) -> Vec<Declaration> {
        let year = self.year_filter.trim();
        let year = (!year.is_empty()).then_some(year);
        self.declarations
            .data()
            .map(|d| filter_declarations_by_year(d.clone(), year))
            .unwrap_or_default()
    }

    fn receipt_summary(&self) -> Vec<ReceiptGroupSummary> {
        self.receipts
            .data()
            .map(|g| aggregate_receipts(g.clone(), &self.receipt_filter))
            .unwrap_or_default()
    }

    fn ledger_len(&self, ledger: Ledger) -> usize {
        match ledger {
            Ledger::Declarations => self.filtered_declarations().len(),
            Ledger::Receipts => tree_rows(&self.receipt_summary(), &self.expanded).len(),
            Ledger::Vehicles => self.vehicles.data().map(Vec::len).unwrap_or(0),
            Ledger::Cadastral => self.cadastral.data().map(Vec::len).unwrap_or(0),
            Ledger::Alcabala => self.alcabala.data().map(Vec::len).unwrap_or(0),
        }
    }

    // -- drawing ----------------------------------------------------------

    fn draw(&mut self, frame: &mut Frame) {
        match self.screen {
            Screen::Search => self.draw_search(frame),
            Screen::Menu => self.draw_menu(frame),
            Screen::Ledger(ledger) => self.draw_ledger(frame, ledger),
            Screen::Users => self.draw_users(frame),
        }
    }

    fn title(&self, section: &str) -> String {
        format!("{}  ·  {section}", self.session.user.display_name())
    }

    fn footer<'a>(&'a self, hints: &'a str) -> Line<'a> {
        footer_line(self.error.as_deref(), self.notice.as_deref(), hints)
    }

    fn draw_search(&mut self, frame: &mut Frame) {
        let hints = if self.input == Input::Document {
            "Type a DNI/RUC  Enter=search  Tab=results  Esc=quit"
        } else if self.input == Input::EntityFilter {
            "Type to filter entities  Enter=done  Esc=clear"
        } else {
            "Up/Down=select  Enter=open  /=filter  s=new search  r=refresh  u=users  q=quit"
        };
        let title = self.title("Taxpayer search");
        let body = chrome(frame, &title, self.footer(hints));

        let advice = self.session.user.password_advice(Utc::now());
        let advice_height = if advice.is_some() { 2 } else { 0 };
        let [advice_area, input_area, summary_area, list_area] = Layout::vertical([
            Constraint::Length(advice_height),
            Constraint::Length(2),
            Constraint::Length(2),
            Constraint::Fill(1),
        ])
        .areas(body);

        if let Some(advice) = advice {
            let (text, _) = wrap_text(&advice.message(), advice_area.width.saturating_sub(2) as usize);
            frame.render_widget(Paragraph::new(format!(" {text}")).style(NOTICE_STYLE), advice_area);
        }

        let cursor = if self.input == Input::Document { "_" } else { "" };
        frame.render_widget(
            Paragraph::new(Line::from(vec![
                Span::styled(" DNI / RUC: ", Style::default().add_modifier(Modifier::BOLD)),
                Span::raw(format!("{}{cursor}", self.document)),
                Span::styled(
                    format!("  {}/{MAX_DOCUMENT_LEN}", self.document.len()),
                    MUTED_STYLE,
                ),
            ])),
            input_area,
        );

        match self.search.state() {
            LoadState::Idle => {}
            LoadState::Loading => {
                frame.render_widget(Paragraph::new(" Searching...").style(MUTED_STYLE), summary_area);
            }
            LoadState::Failed(msg) => {
                frame.render_widget(
                    Paragraph::new(format!(" {msg}")).style(ERROR_STYLE),
                    summary_area,
                );
            }
            LoadState::Loaded(all) if all.is_empty() => {
                frame.render_widget(Paragraph::new(format!(" {NO_INFORMATION}")).style(NOTICE_STYLE), summary_area);
            }
            LoadState::Loaded(all) => {
                let summary = summarize_search(all, &self.entity_filter);
                let taxpayer = all
                    .first()
                    .map(|m| format!("{} ({})", m.taxpayer_name, m.document_number))
                    .unwrap_or_default();
                let filter = if self.entity_filter.is_empty() && self.input != Input::EntityFilter {
                    String::new()
                } else {
                    format!("   Filter: {}", self.entity_filter)
                };
                let lines = vec![
                    Line::from(Span::styled(format!(" {taxpayer}"), HEADER_STYLE)),
                    Line::from(vec![
                        Span::raw(format!(" {} records   Total debt ", summary.rows.len())),
                        money_span(summary.total_debt),
                        Span::styled(filter, MUTED_STYLE),
                    ]),
                ];
                frame.render_widget(Paragraph::new(lines), summary_area);

                let lines: Vec<Line> = summary
                    .rows
                    .iter()
                    .map(|m| {
                        Line::from(vec![
                            Span::raw(format!(" {}  ", pad(&m.entity_name, 40))),
                            Span::raw(format!("{}  ", pad(&m.taxpayer_name, 30))),
                            money_span(m.outstanding_debt),
                        ])
                    })
                    .collect();
                let selected = (self.input == Input::None).then_some(self.results.selection);
                render_list(frame, list_area, lines, selected, &mut self.results.offset);
            }
        }
    }

    fn draw_menu(&mut self, frame: &mut Frame) {
        let title = self.title("Consultation");
        let body = chrome(frame, &title, self.footer("Up/Down=select  Enter=open  1-5=jump  Esc=back"));
        let Some(m) = &self.selected_match else {
            return;
        };
        let mut lines = vec![
            Line::from(Span::styled(format!(" {}", m.entity_name), HEADER_STYLE)),
            Line::from(vec![
                Span::raw(format!(" {} ({})   Debt ", m.taxpayer_name, m.document_number)),
                money_span(m.outstanding_debt),
            ]),
            Line::from(""),
        ];
        for (i, ledger) in LEDGERS.iter().enumerate() {
            let text = format!(" {}. {}", i + 1, ledger.title());
            if i == self.menu.selection {
                lines.push(Line::from(Span::styled(format!("▸{text}"), SELECTED_STYLE)));
            } else {
                lines.push(Line::from(format!(" {text}")));
            }
        }
        frame.render_widget(Paragraph::new(lines), body);
    }

    fn draw_ledger(&mut self, frame: &mut Frame, ledger: Ledger) {
        let hints = match ledger {
            Ledger::Declarations => "Enter=report URL  y=year  r=refresh  Esc=back",
            Ledger::Receipts => "Enter=expand  y=year  n=number  m=memo  r=refresh  Esc=back",
            Ledger::Vehicles => "r=refresh  Esc=back",
            Ledger::Cadastral => "Enter=fetch document  r=refresh  Esc=back",
            Ledger::Alcabala => "Enter=report URL  r=refresh  Esc=back",
        };
        let hints = match self.input {
            Input::Year => "Type a year  Enter=apply  Esc=clear",
            Input::ReceiptNumber | Input::ReceiptMemo => "Type to filter  Enter=done  Esc=clear",
            _ => hints,
        };
        let title = self.title(ledger.title());
        let body = chrome(frame, &title, self.footer(hints));
        let [filter_area, header_area, list_area, totals_area] = Layout::vertical([
            Constraint::Length(1),
            Constraint::Length(1),
            Constraint::Fill(1),
            Constraint::Length(1),
        ])
        .areas(body);

        frame.render_widget(Paragraph::new(self.filter_line(ledger)).style(MUTED_STYLE), filter_area);

        let (state, empty) = match ledger {
            Ledger::Declarations => (state_of(&self.declarations), "No declarations found."),
            Ledger::Receipts => (state_of(&self.receipts), "No receipts found."),
            Ledger::Vehicles => (state_of(&self.vehicles), "No vehicle tax records found."),
            Ledger::Cadastral => (state_of(&self.cadastral), "No cadastral documents found."),
            Ledger::Alcabala => (state_of(&self.alcabala), "No property transfer tax records found."),
        };
        match state {
            ViewState::Idle => return,
            ViewState::Loading => {
                frame.render_widget(Paragraph::new(" Loading...").style(MUTED_STYLE), list_area);
                return;
            }
            ViewState::Failed(msg) => {
                frame.render_widget(
                    Paragraph::new(format!(" {msg}")).style(ERROR_STYLE),
                    list_area,
                );
                return;
            }
            ViewState::Loaded => {}
        }

        let (header, lines, totals) = match ledger {
            Ledger::Declarations => self.declaration_lines(),
            Ledger::Receipts => self.receipt_lines(),
            Ledger::Vehicles => self.vehicle_lines(),
            Ledger::Cadastral => self.cadastral_lines(),
            Ledger::Alcabala => self.alcabala_lines(),
        };
        if lines.is_empty() {
            frame.render_widget(Paragraph::new(format!(" {empty}")).style(MUTED_STYLE), list_area);
            return;
        }
        self.rows.clamp(lines.len());
        frame.render_widget(
            Paragraph::new(header).style(Style::default().add_modifier(Modifier::BOLD)),
            header_area,
        );
        let selected = (self.input == Input::None).then_some(self.rows.selection);
        render_list(frame, list_area, lines, selected, &mut self.rows.offset);
        frame.render_widget(Paragraph::new(totals), totals_area);
    }

    fn year_label(&self) -> &str {
        if self.year_filter.is_empty() && self.input != Input::Year {
            "all"
        } else {
            self.year_filter.as_str()
        }
    }

    fn filter_line(&self, ledger: Ledger) -> String {
        let mark = |input: Input| if self.input == input { "_" } else { "" };
        match ledger {
            Ledger::Declarations => format!(
                " Year: {}{}",
                self.year_label(),
                mark(Input::Year)
            ),
            Ledger::Receipts => format!(
                " Year: {}{}   Number: {}{}   Memo: {}{}",
                self.year_label(),
                mark(Input::Year),
                self.receipt_filter.number,
                mark(Input::ReceiptNumber),
                self.receipt_filter.memo,
                mark(Input::ReceiptMemo),
            ),
            _ => String::new(),
        }
    }

    fn declaration_lines(&self) -> (String, Vec<Line<'static>>, Line<'static>) {
        let rows = self.filtered_declarations();
        let header = format!(
            " {} {} {} {} {:>14} {:>14} {:>14}",
            pad("Year", 6), pad("Number", 12), pad("Date", 10), pad("Reason", 24), "Total", "Paid", "Balance"
        );
        let lines = rows
            .iter()
            .map(|d| {
                let cancelled = if d.cancelled { " (cancelled)" } else { "" };
                Line::from(vec![
                    Span::raw(format!(
                        " {} {} {} {} ",
                        pad(&d.year, 6),
                        pad(&d.number, 12),
                        pad(&date(d.date.as_deref()), 10),
                        pad(&d.reason, 24)
                    )),
                    Span::raw(format!("{:>14} {:>14} ", money(d.total), money(d.paid))),
                    money_span(d.balance),
                    Span::styled(cancelled.to_string(), MUTED_STYLE),
                ])
            })
            .collect();
        let t = declaration_totals(&rows);
        let totals = Line::from(vec![
            Span::styled(" Debt ", Style::default().add_modifier(Modifier::BOLD)),
            Span::raw(money(t.debt)),
            Span::raw("   Paid "),
            Span::raw(money(t.paid)),
            Span::raw("   Balance "),
            money_span(t.balance),
        ]);
        (header, lines, totals)
    }

    fn receipt_lines(&self) -> (String, Vec<Line<'static>>, Line<'static>) {
        let groups = self.receipt_summary();
        let header = format!(" {} {:>14}", pad("Series / receipt / item", 70), "Total");
        let mut lines = Vec::new();
        for row in tree_rows(&groups, &self.expanded) {
            match row {
                TreeRow::Group(g) => {
                    let group = &groups[g];
                    let open = self.expanded.is_expanded(&group_key(group, g));
                    let count = group.receipts.len();
                    let label = format!(
                        "{} Series {}  {}  {} {}",
                        if open { "▾" } else { "▸" },
                        group.series,
                        datetime(group.issued_at.as_deref()),
                        count,
                        if count == 1 { "receipt" } else { "receipts" }
                    );
                    lines.push(Line::from(vec![
                        Span::styled(format!(" {} ", pad(&label, 70)), Style::default().add_modifier(Modifier::BOLD)),
                        Span::raw(format!("{:>14}", money(group.total))),
                    ]));
                }
                TreeRow::Receipt(g, r) => {
                    let summary = &groups[g].receipts[r];
                    let open = self.expanded.is_expanded(&receipt_key(&groups[g], g, r));
                    let cancelled = if summary.receipt.cancelled { " [cancelled]" } else { "" };
                    let label = format!(
                        "  {} {}  {}  {}{cancelled}",
                        if open { "▾" } else { "▸" },
                        summary.receipt.number,
                        date(summary.receipt.issued_on.as_deref()),
                        summary.receipt.memo.as_deref().unwrap_or(&summary.preview),
                    );
                    lines.push(Line::from(format!(" {} {:>14}", pad(&label, 70), money(summary.total))));
                }
                TreeRow::Item(g, r, i) => {
                    let item = &groups[g].receipts[r].receipt.line_items[i];
                    let label = format!("      {}", item.description);
                    lines.push(Line::from(Span::styled(
                        format!(" {} {:>14}", pad(&label, 70), money(item.amount)),
                        MUTED_STYLE,
                    )));
                }
            }
        }
        let totals = Line::from(vec![
            Span::styled(" Grand total ", Style::default().add_modifier(Modifier::BOLD)),
            Span::raw(money(receipts_grand_total(&groups))),
        ]);
        (header, lines, totals)
    }

    fn vehicle_lines(&self) -> (String, Vec<Line<'static>>, Line<'static>) {
        let rows = self.vehicles.data().cloned().unwrap_or_default();
        let header = format!(
            " {} {} {} {} {:>14} {:>14} {:>14}",
            pad("Year", 6), pad("Number", 10), pad("Plate", 10), pad("Owner", 28), "Tax", "Paid", "Balance"
        );
        let lines = rows
            .iter()
            .map(|v| {
                let mut flags = Vec::new();
                if v.settled {
                    flags.push("settled");
                }
                if v.cancelled {
                    flags.push("cancelled");
                }
                Line::from(vec![
                    Span::raw(format!(
                        " {} {} {} {} ",
                        pad(&v.year, 6),
                        pad(&v.number, 10),
                        pad(&v.plate, 10),
                        pad(&v.owner_name, 28)
                    )),
                    Span::raw(format!("{:>14} {:>14} ", money(v.tax), money(v.paid))),
                    money_span(v.balance),
                    Span::styled(format!(" {}", flags.join(", ")), MUTED_STYLE),
                ])
            })
            .collect();
        let t = vehicle_totals(&rows);
        let totals = Line::from(vec![
            Span::styled(" Tax ", Style::default().add_modifier(Modifier::BOLD)),
            Span::raw(money(t.tax)),
            Span::raw("   Debt "),
            Span::raw(money(t.debt)),
            Span::raw("   Paid "),
            Span::raw(money(t.paid)),
            Span::raw("   Balance "),
            money_span(t.balance),
        ]);
        (header, lines, totals)
    }

    fn cadastral_lines(&self) -> (String, Vec<Line<'static>>, Line<'static>) {
        let docs = self.cadastral.data().cloned().unwrap_or_default();
        let header = format!(
            "   {} {} {} {} {}",
            pad("Number", 10), pad("Document", 30), pad("Year", 6), pad("Date", 10), "Signed by"
        );
        let lines = docs
            .iter()
            .enumerate()
            .map(|(i, d)| {
                let marker = if self.cadastral.is_row_busy(i) {
                    "…"
                } else if d.digitally_signed {
                    "✓"
                } else {
                    " "
                };
                let mut spans = vec![Span::raw(format!(
                    " {marker} {} {} {} {} {}",
                    pad(&d.number, 10),
                    pad(&d.name, 30),
                    pad(&d.year, 6),
                    pad(&date(d.date.as_deref()), 10),
                    d.signatory
                ))];
                if let Some(err) = self.cadastral.row_error(i) {
                    spans.push(Span::styled(format!("  {err}"), ERROR_STYLE));
                }
                Line::from(spans)
            })
            .collect();
        let signed = docs.iter().filter(|d| d.digitally_signed).count();
        let totals = Line::from(Span::styled(
            format!(" {} documents, {signed} digitally signed", docs.len()),
            MUTED_STYLE,
        ));
        (header, lines, totals)
    }

    fn alcabala_lines(&self) -> (String, Vec<Line<'static>>, Line<'static>) {
        let rows = self.alcabala.data().cloned().unwrap_or_default();
        let columns: Vec<String> = alcabala_columns(&rows).into_iter().take(5).collect();
        let mut header = format!(" {} {}", pad("Year", 6), pad("Id", 10));
        for c in &columns {
            header.push_str(&format!(" {}", pad(c, 18)));
        }
        let lines = rows
            .iter()
            .map(|r| {
                let mut text = format!(
                    " {} {}",
                    pad(&r.year, 6),
                    pad(&r.ide_alc.as_ref().map(Ident::key).unwrap_or_default(), 10)
                );
                for c in &columns {
                    let value = r.columns.get(c).and_then(text_of).unwrap_or_default();
                    text.push_str(&format!(" {}", pad(&value, 18)));
                }
                Line::from(text)
            })
            .collect();
        let totals = Line::from(Span::styled(format!(" {} records", rows.len()), MUTED_STYLE));
        (header, lines, totals)
    }

    fn draw_users(&mut self, frame: &mut Frame) {
        let title = self.title("Users");
        let body = chrome(frame, &title, self.footer("Up/Down=select  Enter/t=toggle active  r=refresh  Esc=back"));
        match self.users.state() {
            LoadState::Idle => {}
            LoadState::Loading => {
                frame.render_widget(Paragraph::new(" Loading...").style(MUTED_STYLE), body);
            }
            LoadState::Failed(msg) => {
                frame.render_widget(Paragraph::new(format!(" {msg}")).style(ERROR_STYLE), body);
            }
            LoadState::Loaded(users) => {
                let ordered = ordered_users(users);
                self.rows.clamp(ordered.len());
                let mut lines = Vec::new();
                let mut selected_line = None;
                let mut current_group: Option<&str> = None;
                for (i, (group, u)) in ordered.iter().enumerate() {
                    if current_group != Some(group.as_str()) {
                        lines.push(Line::from(Span::styled(format!(" {group}"), HEADER_STYLE)));
                        current_group = Some(group.as_str());
                    }
                    if i == self.rows.selection {
                        selected_line = Some(lines.len());
                    }
                    let status = if self.users.is_row_busy(i) {
                        Span::styled("updating…", MUTED_STYLE)
                    } else if u.active {
                        Span::styled("active", CLEAR_STYLE)
                    } else {
                        Span::styled("inactive", DEBT_STYLE)
                    };
                    lines.push(Line::from(vec![
                        Span::raw(format!(
                            "   {} {} {} ",
                            pad(&u.name, 28),
                            pad(&u.email, 32),
                            pad(if u.is_admin { "admin" } else { "" }, 6)
                        )),
                        status,
                        Span::styled(
                            format!("  created {}  admin:{}", datetime(u.created_at.as_deref()), yes_no(u.is_admin)),
                            MUTED_STYLE,
                        ),
                    ]));
                }
                render_list(frame, body, lines, selected_line, &mut self.rows.offset);
            }
        }
    }
}

enum ViewState {
    Idle,
    Loading,
    Failed(String),
    Loaded,
}

fn state_of<T>(d: &Drilldown<T>) -> ViewState {
    match d.state() {
        LoadState::Idle => ViewState::Idle,
        LoadState::Loading => ViewState::Loading,
        LoadState::Failed(msg) => ViewState::Failed(msg.clone()),
        LoadState::Loaded(_) => ViewState::Loaded,
    }
}

/// Users in display order: grouped by organisation, first-seen order kept.
fn ordered_users(users: &[ManagedUser]) -> Vec<(String, ManagedUser)> {
    group_users(users.to_vec())
        .into_iter()
        .flat_map(|g| {
            let name = g.display_name;
            g.members.into_iter().map(move |u| (name.clone(), u))
        })
        .collect()
}

fn group_key(group: &ReceiptGroupSummary, index: usize) -> String {
    format!("g:{index}:{}", group.key())
}

fn receipt_key(group: &ReceiptGroupSummary, index: usize, receipt: usize) -> String {
    format!("r:{index}:{}:{receipt}", group.key())
}

fn tree_rows(groups: &[ReceiptGroupSummary], expanded: &Expanded) -> Vec<TreeRow> {
    let mut rows = Vec::new();
    for (g, group) in groups.iter().enumerate() {
        rows.push(TreeRow::Group(g));
        if !expanded.is_expanded(&group_key(group, g)) {
            continue;
        }
        for (r, summary) in group.receipts.iter().enumerate() {
            rows.push(TreeRow::Receipt(g, r));
            if expanded.is_expanded(&receipt_key(group, g, r)) {
                for i in 0..summary.receipt.line_items.len() {
                    rows.push(TreeRow::Item(g, r, i));
                }
            }
        }
    }
    rows
}

/// Left-align in a fixed-width column, truncating with an ellipsis.
fn pad(text: &str, width: usize) -> String {
    let count = text.chars().count();
    if count > width {
        let cut: String = text.chars().take(width.saturating_sub(1)).collect();
        format!("{cut}…")
    } else {
        format!("{text}{}", " ".repeat(width - count))
    }
}

fn render_list(
    frame: &mut Frame,
    area: Rect,
    mut lines: Vec<Line<'static>>,
    selected: Option<usize>,
    offset: &mut usize,
) {
    let height = area.height as usize;
    if let Some(sel) = selected {
        *offset = scroll_offset(sel, *offset, height);
        if let Some(line) = lines.get_mut(sel) {
            *line = line.clone().style(SELECTED_STYLE);
        }
    }
    let visible: Vec<Line> = lines.into_iter().skip(*offset).take(height).collect();
    frame.render_widget(Paragraph::new(visible), area);
}

pub fn run() -> Result<()> {
    let settings = load_settings();
    let store = SessionStore::open_default();
    let session = match authorize(&store, &Route::Dashboard) {
        Access::Authenticated(session) => session,
        _ => return Err(ConsultaError::NotAuthenticated),
    };

    let (tx, rx): (Sender<Message>, Receiver<Message>) = mpsc::channel();
    let mut dashboard = Dashboard::new(settings, store, session, tx)?;

    install_panic_hook();
    let mut terminal = ratatui::init();

    let result: Result<()> = loop {
        while let Ok(msg) = rx.try_recv() {
            dashboard.apply(msg);
        }
        if dashboard.quit {
            break Ok(());
        }
        if let Err(e) = terminal.draw(|frame| dashboard.draw(frame)) {
            break Err(e.into());
        }
        match event::poll(POLL_INTERVAL) {
            Ok(false) => continue,
            Ok(true) => {}
            Err(e) => break Err(e.into()),
        }
        match event::read() {
            Err(e) => break Err(e.into()),
            Ok(Event::Key(key)) => {
                if key.kind != KeyEventKind::Press {
                    continue;
                }
                if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
                    break Ok(());
                }
                dashboard.handle_key(key.code);
            }
            _ => {}
        }
    };

    drop(terminal);
    ratatui::restore();
    if let Some(msg) = dashboard.exit_message.take() {
        println!("{msg}");
    }
    result
}
