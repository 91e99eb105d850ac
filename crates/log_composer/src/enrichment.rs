//! Enrichment: contextual properties attached to every event, and the output template
//! fragments that display them.
//!
//! An [`EnrichmentPlan`] records which [`EnrichmentKind`]s are wanted. Applying the plan
//! registers one field provider per enabled kind and composes the output template from
//! [`DEFAULT_PREFIX`], the fragment of every enabled kind and [`DEFAULT_SUFFIX`]. Kinds are
//! always applied in [`EnrichmentKind::ORDER`], whatever order they were requested in, so the
//! placeholders of a given plan always sit at the same position in the template.

use std::{
    collections::BTreeSet,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use serde_json::Value;

use crate::{
    event::{EventContext, LogEvent},
    request_context::RequestContext,
    template::{DEFAULT_PREFIX, DEFAULT_SUFFIX},
};

/// Environment variable naming the deployment environment.
pub const ENVIRONMENT_NAME_VARIABLE: &str = "APP_ENVIRONMENT";

/// Environment name reported when [`ENVIRONMENT_NAME_VARIABLE`] is not set.
pub const DEFAULT_ENVIRONMENT_NAME: &str = "Production";

/// Thread name reported for threads without a name, unless the plan overrides it.
pub const DEFAULT_THREAD_NAME: &str = "default-thread-name";

/// Request header holding the correlation id, also the default client-info header.
pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

mod properties {
    pub(super) const ENVIRONMENT_NAME: &str = "EnvironmentName";
    pub(super) const MACHINE_NAME: &str = "MachineName";
    pub(super) const ENVIRONMENT_USER_NAME: &str = "EnvironmentUserName";
    pub(super) const PROCESS_ID: &str = "ProcessId";
    pub(super) const PROCESS_NAME: &str = "ProcessName";
    pub(super) const EXCEPTION_DETAIL: &str = "ExceptionDetail";
    pub(super) const THREAD_ID: &str = "ThreadId";
    pub(super) const THREAD_NAME: &str = "ThreadName";
    pub(super) const CLIENT_IP: &str = "ClientIp";
    pub(super) const CORRELATION_ID: &str = "CorrelationId";
}

/// Adds properties to a captured event.
///
/// Enrichers run on the thread that emitted the event, after the event's own fields, span
/// fields and static properties were collected. They should only add properties that are
/// absent.
pub trait Enricher: Send + Sync {
    /// Short name used in diagnostics.
    fn name(&self) -> &'static str;

    /// Adds properties to `event`.
    fn enrich(&self, event: &mut LogEvent);
}

/// A contextual field that can be attached to every event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EnrichmentKind {
    /// Name of the deployment environment.
    EnvironmentName,

    /// Host name of the machine.
    MachineName,

    /// Name of the user the process runs as.
    EnvironmentUserName,

    /// Id of the current process.
    ProcessId,

    /// Name of the current executable.
    ProcessName,

    /// Structured form of the error attached to the event.
    ExceptionDetail,

    /// Process-unique id of the emitting thread.
    ThreadId,

    /// Name of the emitting thread.
    ThreadName,

    /// Client address and a configured request header.
    ClientInfo,
}

impl EnrichmentKind {
    /// The order kinds are applied in, and their fragments appear in the template in.
    pub const ORDER: [Self; 9] = [
        Self::EnvironmentName,
        Self::MachineName,
        Self::EnvironmentUserName,
        Self::ProcessId,
        Self::ProcessName,
        Self::ExceptionDetail,
        Self::ThreadId,
        Self::ThreadName,
        Self::ClientInfo,
    ];

    /// Output template fragment displaying the field.
    pub fn fragment(self) -> &'static str {
        match self {
            Self::EnvironmentName => " EnvironmentName: {EnvironmentName}, ",
            Self::MachineName => " MachineName: {MachineName}, ",
            Self::EnvironmentUserName => " EnvironmentUserName: {EnvironmentUserName}, ",
            Self::ProcessId => " Process: {ProcessId}, ",
            Self::ProcessName => " ProcessName: {ProcessName}, ",
            Self::ExceptionDetail => " ExceptionDetail: {ExceptionDetail}, ",
            Self::ThreadId => "ThreadId:{ThreadId},",
            Self::ThreadName => "ThreadName:{ThreadName},",
            Self::ClientInfo => " ClientIp:{ClientIp},",
        }
    }
}

/// Which contextual fields to attach to every event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrichmentPlan {
    kinds: BTreeSet<EnrichmentKind>,
    default_thread_name: String,
    header_name: String,
    add_value_if_header_absent: bool,
}

impl Default for EnrichmentPlan {
    fn default() -> Self {
        Self {
            kinds: BTreeSet::new(),
            default_thread_name: DEFAULT_THREAD_NAME.to_string(),
            header_name: CORRELATION_ID_HEADER.to_string(),
            add_value_if_header_absent: false,
        }
    }
}

impl EnrichmentPlan {
    /// Creates a plan with no fields enabled.
    pub fn new() -> Self {
        Self::default()
    }

    fn set(&mut self, kind: EnrichmentKind, enabled: bool) {
        if enabled {
            self.kinds.insert(kind);
        } else {
            self.kinds.remove(&kind);
        }
    }

    /// Enables a single field.
    #[must_use]
    pub fn with_kind(mut self, kind: EnrichmentKind) -> Self {
        self.kinds.insert(kind);
        self
    }

    /// Chooses the machine, user and environment name fields.
    #[must_use]
    #[allow(clippy::fn_params_excessive_bools)]
    pub fn with_environment(
        mut self,
        show_machine_name: bool,
        show_user_name: bool,
        show_environment_name: bool,
    ) -> Self {
        self.set(EnrichmentKind::MachineName, show_machine_name);
        self.set(EnrichmentKind::EnvironmentUserName, show_user_name);
        self.set(EnrichmentKind::EnvironmentName, show_environment_name);
        self
    }

    /// Chooses the process name and process id fields.
    #[must_use]
    pub fn with_process(mut self, show_process_name: bool, show_process_id: bool) -> Self {
        self.set(EnrichmentKind::ProcessName, show_process_name);
        self.set(EnrichmentKind::ProcessId, show_process_id);
        self
    }

    /// Chooses the thread name and thread id fields. `default_thread_name` is reported for
    /// threads without a name.
    #[must_use]
    pub fn with_thread(
        mut self,
        show_thread_name: bool,
        show_thread_id: bool,
        default_thread_name: impl Into<String>,
    ) -> Self {
        self.set(EnrichmentKind::ThreadName, show_thread_name);
        self.set(EnrichmentKind::ThreadId, show_thread_id);
        self.default_thread_name = default_thread_name.into();
        self
    }

    /// Enables the client address and the `header_name` request header.
    ///
    /// When the header is missing from a request, the property is left out of the event unless
    /// `add_value_if_header_absent` is set, in which case it is attached with an empty value.
    /// `ClientIp` is attached whenever the request carries an address, header or not.
    #[must_use]
    pub fn with_client_info(
        mut self,
        header_name: impl Into<String>,
        add_value_if_header_absent: bool,
    ) -> Self {
        self.kinds.insert(EnrichmentKind::ClientInfo);
        self.header_name = header_name.into();
        self.add_value_if_header_absent = add_value_if_header_absent;
        self
    }

    /// Enables the structured exception detail field.
    #[must_use]
    pub fn with_exception_details(mut self) -> Self {
        self.kinds.insert(EnrichmentKind::ExceptionDetail);
        self
    }

    /// Whether `kind` is enabled.
    pub fn is_enabled(&self, kind: EnrichmentKind) -> bool {
        self.kinds.contains(&kind)
    }

    /// The enabled kinds, in [`EnrichmentKind::ORDER`].
    pub fn enabled_kinds(&self) -> impl Iterator<Item = EnrichmentKind> + '_ {
        EnrichmentKind::ORDER
            .into_iter()
            .filter(|kind| self.kinds.contains(kind))
    }

    /// The output template this plan produces.
    pub fn output_template(&self) -> String {
        let mut template = String::from(DEFAULT_PREFIX);
        template.extend(self.enabled_kinds().map(EnrichmentKind::fragment));
        template.push_str(DEFAULT_SUFFIX);
        template
    }

    /// Registers the provider of every enabled kind, in order, followed by the correlation-id
    /// provider, which is registered whatever the plan. Returns the composed output template.
    pub(crate) fn apply(&self, context: &mut EventContext) -> String {
        for kind in self.enabled_kinds() {
            for provider in self.providers(kind) {
                context.register(Arc::new(provider));
            }
        }
        context.register(Arc::new(FieldProvider::CorrelationId));

        self.output_template()
    }

    fn providers(&self, kind: EnrichmentKind) -> Vec<FieldProvider> {
        match kind {
            EnrichmentKind::EnvironmentName => vec![FieldProvider::EnvironmentName(
                std::env::var(ENVIRONMENT_NAME_VARIABLE)
                    .unwrap_or_else(|_| DEFAULT_ENVIRONMENT_NAME.to_string()),
            )],
            EnrichmentKind::MachineName => vec![FieldProvider::MachineName(
                gethostname::gethostname().to_string_lossy().into_owned(),
            )],
            EnrichmentKind::EnvironmentUserName => vec![FieldProvider::EnvironmentUserName(
                std::env::var("USER")
                    .or_else(|_| std::env::var("USERNAME"))
                    .ok(),
            )],
            EnrichmentKind::ProcessId => vec![FieldProvider::ProcessId(std::process::id())],
            EnrichmentKind::ProcessName => vec![FieldProvider::ProcessName(
                std::env::current_exe()
                    .ok()
                    .and_then(|path| {
                        path.file_stem()
                            .map(|stem| stem.to_string_lossy().into_owned())
                    })
                    .unwrap_or_default(),
            )],
            EnrichmentKind::ExceptionDetail => vec![FieldProvider::ExceptionDetail],
            EnrichmentKind::ThreadId => vec![FieldProvider::ThreadId],
            EnrichmentKind::ThreadName => vec![FieldProvider::ThreadName {
                default_name: self.default_thread_name.clone(),
            }],
            EnrichmentKind::ClientInfo => vec![
                FieldProvider::ClientIp,
                FieldProvider::RequestHeader {
                    header_name: self.header_name.clone(),
                    property_name: self.header_name.replace('-', ""),
                    add_value_if_absent: self.add_value_if_header_absent,
                },
            ],
        }
    }
}

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_ID: u64 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
}

/// The built-in field providers. Values that cannot change during the life of the process are
/// resolved once, when the provider is registered.
#[derive(Debug, Clone, PartialEq, Eq)]
enum FieldProvider {
    EnvironmentName(String),
    MachineName(String),
    EnvironmentUserName(Option<String>),
    ProcessId(u32),
    ProcessName(String),
    ExceptionDetail,
    ThreadId,
    ThreadName {
        default_name: String,
    },
    ClientIp,
    RequestHeader {
        header_name: String,
        property_name: String,
        add_value_if_absent: bool,
    },
    CorrelationId,
}

impl Enricher for FieldProvider {
    fn name(&self) -> &'static str {
        match self {
            Self::EnvironmentName(_) => properties::ENVIRONMENT_NAME,
            Self::MachineName(_) => properties::MACHINE_NAME,
            Self::EnvironmentUserName(_) => properties::ENVIRONMENT_USER_NAME,
            Self::ProcessId(_) => properties::PROCESS_ID,
            Self::ProcessName(_) => properties::PROCESS_NAME,
            Self::ExceptionDetail => properties::EXCEPTION_DETAIL,
            Self::ThreadId => properties::THREAD_ID,
            Self::ThreadName { .. } => properties::THREAD_NAME,
            Self::ClientIp => properties::CLIENT_IP,
            Self::RequestHeader { .. } => "RequestHeader",
            Self::CorrelationId => properties::CORRELATION_ID,
        }
    }

    fn enrich(&self, event: &mut LogEvent) {
        match self {
            Self::EnvironmentName(name) => {
                event.add_property_if_absent(properties::ENVIRONMENT_NAME, name.as_str());
            }
            Self::MachineName(name) => {
                event.add_property_if_absent(properties::MACHINE_NAME, name.as_str());
            }
            Self::EnvironmentUserName(user) => {
                if let Some(user) = user {
                    event.add_property_if_absent(properties::ENVIRONMENT_USER_NAME, user.as_str());
                }
            }
            Self::ProcessId(pid) => event.add_property_if_absent(properties::PROCESS_ID, *pid),
            Self::ProcessName(name) => {
                event.add_property_if_absent(properties::PROCESS_NAME, name.as_str());
            }
            Self::ExceptionDetail => {
                if let Some(detail) = event.exception.as_ref().map(|exception| exception.detail())
                {
                    event.add_property_if_absent(properties::EXCEPTION_DETAIL, detail);
                }
            }
            Self::ThreadId => {
                let id = THREAD_ID.with(|id| *id);
                event.add_property_if_absent(properties::THREAD_ID, id);
            }
            Self::ThreadName { default_name } => {
                let name = std::thread::current()
                    .name()
                    .map_or_else(|| default_name.clone(), ToString::to_string);
                event.add_property_if_absent(properties::THREAD_NAME, name);
            }
            Self::ClientIp => {
                let client_ip = RequestContext::with_current(|context| {
                    context.and_then(RequestContext::client_ip)
                });
                if let Some(client_ip) = client_ip {
                    event.add_property_if_absent(properties::CLIENT_IP, client_ip.to_string());
                }
            }
            Self::RequestHeader {
                header_name,
                property_name,
                add_value_if_absent,
            } => {
                let value = RequestContext::with_current(|context| {
                    context.and_then(|context| context.header(header_name).map(Value::from))
                });
                match value {
                    Some(value) => event.add_property_if_absent(property_name, value),
                    None if *add_value_if_absent => {
                        event.add_property_if_absent(property_name, "");
                    }
                    None => (),
                }
            }
            Self::CorrelationId => {
                let correlation_id = RequestContext::with_current(|context| {
                    context.and_then(|context| {
                        context.header(CORRELATION_ID_HEADER).map(ToString::to_string)
                    })
                });
                if let Some(correlation_id) = correlation_id {
                    event.add_property_if_absent(properties::CORRELATION_ID, correlation_id);
                }
            }
        }
    }
}
