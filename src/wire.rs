use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::SlotlockAuthSource;
use crate::engine::{
    Engine, EngineError, HoldRequest, PaymentResolution, RejectReason, SlotQuery,
};
use crate::limits::MAX_SLOT_PAGE;
use crate::model::*;
use crate::observability::{QUERIES_TOTAL, QUERY_DURATION_SECONDS, command_label};
use crate::sql::{self, AppointmentFilter, Command};
use crate::tenant::TenantManager;

pub struct SlotlockHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<SlotlockQueryParser>,
}

impl SlotlockHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(SlotlockQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager
            .get_or_create(&db)
            .map_err(|e| user_error("08006", format!("tenant error: {e}")))
    }

    async fn run(&self, engine: &Engine, query: &str) -> PgWireResult<Vec<Response>> {
        let cmd = match sql::parse_sql(query) {
            Ok(cmd) => cmd,
            Err(e) => {
                metrics::counter!(QUERIES_TOTAL, "command" => "unparsed", "status" => "error")
                    .increment(1);
                return Err(sql_err(e));
            }
        };
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(engine, cmd).await;
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        result
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::SelectSlots {
                professional_id,
                start,
                end,
                duration_minutes,
                after,
                notice_days,
                max_results,
            } => {
                let search = engine
                    .find_slots(SlotQuery {
                        professional_id,
                        duration_ms: duration_minutes.saturating_mul(MINUTE_MS),
                        window: request_window(start, end)?,
                        after,
                        notice_days,
                    })
                    .await
                    .map_err(engine_err)?;
                match search.rejection {
                    Some(RejectReason::BeforeNotice { earliest }) => {
                        return Err(user_error(
                            "22023",
                            format!("window ends before the earliest bookable time {earliest}"),
                        ));
                    }
                    Some(RejectReason::Closed) => {
                        return Err(user_error("22023", "no business hours in window".into()));
                    }
                    None => {}
                }

                let page = max_results.unwrap_or(MAX_SLOT_PAGE).min(MAX_SLOT_PAGE);
                let schema = Arc::new(slots_schema());
                let pid = professional_id.to_string();
                let rows: Vec<PgWireResult<_>> = search
                    .slots
                    .take(page)
                    .map(|slot| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&pid)?;
                        encoder.encode_field(&slot.start)?;
                        encoder.encode_field(&slot.end)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::InsertHold {
                professional_id,
                customer_id,
                start,
                end,
                service_ids,
                payment_reference,
            } => {
                let appt = engine
                    .create_hold(HoldRequest {
                        professional_id,
                        customer_id,
                        window: request_window(start, end)?,
                        service_ids,
                        payment_reference,
                    })
                    .await
                    .map_err(engine_err)?;
                Ok(vec![appointment_response(vec![appt])])
            }
            Command::InsertPaymentEvent {
                payment_reference,
                outcome,
            } => {
                let resolution = engine
                    .resolve_payment(&payment_reference, outcome)
                    .await
                    .map_err(engine_err)?;
                let (id, state) = match &resolution {
                    PaymentResolution::Confirmed(appt) => (Some(appt.id), Some(appt.state())),
                    PaymentResolution::AlreadyConfirmed { id, state }
                    | PaymentResolution::Ignored { id, state } => (Some(*id), Some(*state)),
                    PaymentResolution::LeftOnHold { id } => (Some(*id), Some(AppointmentState::Hold)),
                    PaymentResolution::UnknownReference => (None, None),
                };

                let schema = Arc::new(payment_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&payment_reference)?;
                encoder.encode_field(&resolution.label())?;
                encoder.encode_field(&id.map(|id| id.to_string()))?;
                encoder.encode_field(&state.map(AppointmentState::as_str))?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::InsertTransition { id, expected, next } => {
                let appt = engine
                    .request_transition(id, expected, next)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![appointment_response(vec![appt])])
            }
            Command::SelectAppointments { filter } => {
                let appointments = match filter {
                    AppointmentFilter::Id(id) => match engine.get_appointment(&id).await {
                        Ok(appt) => vec![appt],
                        Err(EngineError::NotFound(_)) => Vec::new(),
                        Err(e) => return Err(engine_err(e)),
                    },
                    AppointmentFilter::Professional(pid) => engine.list_appointments(&pid).await,
                    AppointmentFilter::PaymentReference(reference) => engine
                        .appointment_by_payment(&reference)
                        .await
                        .into_iter()
                        .collect(),
                };
                Ok(vec![appointment_response(appointments)])
            }
            Command::SelectEscalations => {
                let schema = Arc::new(escalations_schema());
                let rows: Vec<PgWireResult<_>> = engine
                    .escalations()
                    .into_iter()
                    .map(|e| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&e.id.to_string())?;
                        encoder.encode_field(&e.appointment_id.to_string())?;
                        encoder.encode_field(&e.professional_id.to_string())?;
                        encoder.encode_field(&e.payment_reference)?;
                        encoder.encode_field(&e.state.as_str())?;
                        encoder.encode_field(&e.deposit_amount)?;
                        encoder.encode_field(&e.raised_at)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
        }
    }
}

// ── Result schemas ───────────────────────────────────────────────

fn text(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int8(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn slots_schema() -> Vec<FieldInfo> {
    vec![text("professional_id"), int8("start"), int8("end")]
}

fn appointments_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("professional_id"),
        text("customer_id"),
        text("state"),
        int8("start"),
        int8("end"),
        text("service_ids"),
        text("category"),
        int8("price_total"),
        int8("deposit_amount"),
        text("payment_reference"),
        int8("hold_deadline"),
        text("external_calendar_event_id"),
        text("mirror"),
        int8("created_at"),
    ]
}

fn payment_schema() -> Vec<FieldInfo> {
    vec![
        text("payment_reference"),
        text("resolution"),
        text("appointment_id"),
        text("state"),
    ]
}

fn escalations_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("appointment_id"),
        text("professional_id"),
        text("payment_reference"),
        text("state"),
        int8("deposit_amount"),
        int8("raised_at"),
    ]
}

fn appointment_response(appointments: Vec<Appointment>) -> Response {
    let schema = Arc::new(appointments_schema());
    let rows: Vec<PgWireResult<_>> = appointments
        .into_iter()
        .map(|a| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&a.id.to_string())?;
            encoder.encode_field(&a.professional_id.to_string())?;
            encoder.encode_field(&a.customer_id)?;
            encoder.encode_field(&a.state().as_str())?;
            encoder.encode_field(&a.window.start)?;
            encoder.encode_field(&a.window.end)?;
            encoder.encode_field(&a.service_ids.join(","))?;
            encoder.encode_field(&a.category)?;
            encoder.encode_field(&a.price_total)?;
            encoder.encode_field(&a.deposit_amount)?;
            encoder.encode_field(&a.payment_reference)?;
            encoder.encode_field(&a.hold_deadline())?;
            encoder.encode_field(&a.external_calendar_event_id)?;
            encoder.encode_field(&a.mirror().as_str())?;
            encoder.encode_field(&a.created_at)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

/// Result columns a statement will produce, judged from its text. Statements with
/// `$n` placeholders cannot be parsed before binding.
fn schema_for_statement(sql: &str) -> Vec<FieldInfo> {
    let normalized = sql.split_whitespace().collect::<Vec<_>>().join(" ").to_uppercase();
    if normalized.contains("FROM SLOTS") {
        slots_schema()
    } else if normalized.contains("FROM ESCALATIONS") {
        escalations_schema()
    } else if normalized.contains("INTO PAYMENT_EVENTS") {
        payment_schema()
    } else if normalized.contains("FROM APPOINTMENTS")
        || normalized.contains("INTO HOLDS")
        || normalized.contains("INTO TRANSITIONS")
    {
        appointments_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for SlotlockHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        self.run(&engine, query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotlockQueryParser;

#[async_trait]
impl QueryParser for SlotlockQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(schema_for_statement(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SlotlockHandler {
    type Statement = String;
    type QueryParser = SlotlockQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let sql = substitute_params(portal);
        let mut responses = self.run(&engine, &sql).await?;
        Ok(responses.remove(0))
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            schema_for_statement(&target.statement),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(schema_for_statement(
            &target.statement.statement,
        )))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
/// Highest index first so `$1` never eats the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotlockFactory {
    handler: Arc<SlotlockHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<SlotlockAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl SlotlockFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = SlotlockAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(SlotlockHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotlockFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = SlotlockFactory::new(tenant_manager, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

/// SQLSTATE for each engine failure. `BK001` is ours: payment taken, slot gone.
pub fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::SlotTaken { .. } => "23P01",
        EngineError::StaleStateConflict { .. } => "40001",
        EngineError::ExternalCalendarUnavailable(_) | EngineError::WalError(_) => "58030",
        EngineError::PaidButExpired { .. } => "BK001",
        EngineError::DuplicatePaymentReference(_) => "23505",
        EngineError::NotFound(_) => "P0002",
        EngineError::InvalidRequest(_) => "22023",
        EngineError::LimitExceeded(_) => "54000",
    }
}

fn request_window(start: Ms, end: Ms) -> PgWireResult<Span> {
    Span::checked(start, end).ok_or_else(|| {
        user_error("22023", format!("window start {start} is not before its end {end}"))
    })
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn counts_highest_placeholder() {
        assert_eq!(count_params("SELECT * FROM slots"), 0);
        assert_eq!(count_params("VALUES ($1, $2, $10)"), 10);
        assert_eq!(count_params("price is $ 5"), 0);
    }

    #[test]
    fn schema_follows_statement_text() {
        assert_eq!(schema_for_statement("select *\n  from   slots where x = 1").len(), 3);
        assert_eq!(
            schema_for_statement("INSERT INTO holds (a) VALUES ($1)").len(),
            appointments_schema().len()
        );
        assert_eq!(schema_for_statement("INSERT INTO payment_events VALUES ($1, $2)").len(), 4);
        assert_eq!(schema_for_statement("SELECT * FROM escalations").len(), 7);
        assert!(schema_for_statement("BEGIN").is_empty());
    }

    #[test]
    fn inverted_window_is_a_request_error() {
        assert_eq!(request_window(10, 20).unwrap(), Span::new(10, 20));
        for (start, end) in [(20, 10), (10, 10)] {
            match request_window(start, end) {
                Err(PgWireError::UserError(info)) => assert_eq!(info.code, "22023"),
                other => panic!("expected 22023, got {other:?}"),
            }
        }
    }

    #[test]
    fn engine_errors_map_to_sqlstate() {
        let id = Ulid::new();
        assert_eq!(
            sqlstate(&EngineError::SlotTaken {
                conflicting: BusySource::Appointment(id)
            }),
            "23P01"
        );
        assert_eq!(
            sqlstate(&EngineError::StaleStateConflict {
                id,
                expected: AppointmentState::Hold,
                actual: AppointmentState::Expired,
            }),
            "40001"
        );
        assert_eq!(
            sqlstate(&EngineError::PaidButExpired {
                appointment_id: id,
                payment_reference: "p".into(),
                state: AppointmentState::Expired,
            }),
            "BK001"
        );
        assert_eq!(sqlstate(&EngineError::ExternalCalendarUnavailable("x".into())), "58030");
        assert_eq!(sqlstate(&EngineError::NotFound(id)), "P0002");
    }
}
