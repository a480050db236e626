//! Top-level validation: the session that owns cross-file state, and the
//! per-file walk from the superblock through every reachable object header.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use h5check_io::{Driver, DriverKind, FileIdentity};

use crate::btree_v1;
use crate::btree_v2::{BTreeV2, Record, RecordKind, RecordShape, TieBreaker};
use crate::chunk_index::{ExtensibleArray, FixedArray, CLIENT_CHUNKS, CLIENT_FILTERED_CHUNKS};
use crate::decode::is_undef;
use crate::error::{CheckError, CheckResult, Complaint, Level};
use crate::file_state::{FileContext, FileState};
use crate::fractal_heap::FractalHeap;
use crate::free_space::{self, FreeSpaceOwner};
use crate::global_heap::GlobalHeapCollection;
use crate::local_heap::LocalHeap;
use crate::message_type::MessageType;
use crate::messages::{
    Attribute, AttributeInfo, ChunkIndexKind, ExternalFileList, Layout, LayoutClass, Link, LinkInfo, LinkTarget,
    Message, MessageContext, SharedKind, SharedRef, SohmTableMessage, SymbolTableMessage,
};
use crate::object_header::ObjectHeader;
use crate::options::{CheckOptions, Verbosity};
use crate::report::Report;
use crate::sohm::{self, SohmTable};
use crate::superblock::{DriverInfoBlock, Superblock};
use crate::symbol_table::{ScratchPad, SymbolNode};

/// Dense attribute record flag: the attribute lives in the shared message heap.
const ATTR_RECORD_SHARED: u8 = 0x01;

/// Result of checking one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// No complaints.
    Compliant,
    /// At least one complaint.
    NonCompliant,
    /// A fatal error ended the check early.
    Incomplete,
}

impl Verdict {
    /// Process exit status: 0 compliant, 1 incomplete, 2 non-compliant.
    pub fn exit_code(self) -> i32 {
        match self {
            Verdict::Compliant => 0,
            Verdict::Incomplete => 1,
            Verdict::NonCompliant => 2,
        }
    }
}

/// Counters kept across a session.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    /// Files (or file sets) validated, external targets included.
    pub files: usize,
    /// Object headers decoded and validated.
    pub headers: usize,
    /// External links encountered.
    pub external_links: usize,
}

/// Owns the report, the options and the set of files already validated.
#[derive(Debug)]
pub struct Session {
    options: CheckOptions,
    report: Report,
    external_files: HashSet<FileIdentity>,
    stats: Stats,
    fatal: Vec<String>,
}

impl Session {
    /// New session with an empty report sized by `options`.
    pub fn new(options: CheckOptions) -> Self {
        let report =
            Report::new(options.report_capacity, options.retain).silenced(options.verbosity == Verbosity::Terse);
        Self {
            options,
            report,
            external_files: HashSet::new(),
            stats: Stats::default(),
            fatal: Vec::new(),
        }
    }

    /// Options in force.
    pub fn options(&self) -> &CheckOptions {
        &self.options
    }

    /// Complaints so far.
    pub fn report(&self) -> &Report {
        &self.report
    }

    /// Counters so far.
    pub fn stats(&self) -> Stats {
        self.stats
    }

    /// Messages of the fatal errors that ended checks early.
    pub fn fatal_errors(&self) -> &[String] {
        &self.fatal
    }

    /// Take the report, counters and fatal error messages.
    pub fn into_parts(self) -> (Report, Stats, Vec<String>) {
        (self.report, self.stats, self.fatal)
    }

    /// Open the file (or file set) at `path` and check it.
    pub fn check_path(&mut self, path: &Path) -> Verdict {
        match Driver::open(path) {
            Ok(driver) => self.check_driver(driver),
            Err(e) => {
                tracing::error!(path = %path.display(), "{e}");
                self.fatal.push(e.to_string());
                Verdict::Incomplete
            }
        }
    }

    /// Check the file behind an already open driver.
    pub fn check_driver(&mut self, driver: Driver) -> Verdict {
        let before = self.report.total();
        let name = driver.name().to_path_buf();
        if let Ok(id) = driver.identity() {
            self.external_files.insert(id);
        }
        let prev = self.report.set_current_file(Some(name.clone()));
        let dir = name.parent().map(Path::to_path_buf);
        let result = FileValidator::new(driver, self, dir).run();
        self.report.flush();
        self.report.set_current_file(prev);
        match result {
            Err(e) => {
                tracing::error!(file = %name.display(), "validation stopped: {e}");
                self.fatal.push(e.to_string());
                Verdict::Incomplete
            }
            Ok(()) if self.report.total() == before => Verdict::Compliant,
            Ok(()) => Verdict::NonCompliant,
        }
    }
}

/// Record a structure-local abort and carry on; pass fatal errors up.
fn settle<T>(report: &mut Report, result: CheckResult<T>) -> CheckResult<Option<T>> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(CheckError::Format(c)) => {
            report.record(*c);
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Work found while checking a header, done after its complaints are flushed.
#[derive(Debug, Clone, PartialEq, Eq)]
enum FollowUp {
    Header(u64),
    External { file: String, path: String },
}

fn follow_link(link: &Link, out: &mut Vec<FollowUp>) {
    match &link.target {
        LinkTarget::Hard { addr } => out.push(FollowUp::Header(*addr)),
        LinkTarget::External { file, path } => out.push(FollowUp::External {
            file: file.clone(),
            path: path.clone(),
        }),
        LinkTarget::Soft { .. } | LinkTarget::UserDefined { .. } => {}
    }
}

fn follow_shared(shared: &SharedRef, out: &mut Vec<FollowUp>) {
    if let SharedKind::Committed { addr } = shared.kind {
        out.push(FollowUp::Header(addr));
    }
}

/// Payload of a dense link or attribute record.
fn read_dense(ctx: &mut FileContext<'_>, heap: &FractalHeap, record: &Record) -> CheckResult<Vec<u8>> {
    let id = record
        .heap_id()
        .ok_or_else(|| CheckError::format(Level::Structure, "B-tree v2: record carries no heap ID", heap.address))?;
    if let Record::AttributeName { flags, .. } | Record::AttributeCreationOrder { flags, .. } = record {
        if flags & ATTR_RECORD_SHARED != 0 {
            let state = ctx.state;
            let index = state
                .sohm
                .as_ref()
                .and_then(|t| t.index_for(MessageType::Attribute))
                .ok_or_else(|| {
                    CheckError::format(
                        Level::Structure,
                        "dense attribute: shared attribute without a shared message index",
                        heap.address,
                    )
                })?;
            return sohm::read_message(ctx, index, id);
        }
    }
    heap.read_object(ctx, id)
}

/// Name stored in a dense link or attribute record, for hash tie breaks.
fn dense_name(ctx: &mut FileContext<'_>, heap: &FractalHeap, record: &Record) -> CheckResult<String> {
    let raw = read_dense(ctx, heap, record)?;
    let mut mctx = MessageContext::new(ctx.sizes(), ctx.compat, heap.address);
    match record {
        Record::LinkName { .. } => Ok(Link::decode(&raw, &mut mctx)?.name),
        _ => Ok(Attribute::decode(&raw, &mut mctx)?.name),
    }
}

/// Load the B-tree v2 at `addr`, check its record kind and walk it.
fn walk_dense(
    ctx: &mut FileContext<'_>,
    heap: &FractalHeap,
    addr: u64,
    expected: RecordKind,
) -> CheckResult<Option<Vec<Record>>> {
    let tree = BTreeV2::load(ctx, addr, RecordShape::default());
    let Some(tree) = settle(ctx.report, tree)? else {
        return Ok(None);
    };
    if tree.kind != expected {
        ctx.record(
            Complaint::new(Level::Structure, format!("B-tree v2: expected {expected:?} records"))
                .at(addr)
                .value(u64::from(tree.kind.to_u8())),
        );
        return Ok(None);
    }
    let tie: &mut TieBreaker<'_> = &mut |ctx: &mut FileContext<'_>, a: &Record, b: &Record| -> CheckResult<Ordering> {
        let left = dense_name(ctx, heap, a)?;
        let right = dense_name(ctx, heap, b)?;
        Ok(left.cmp(&right))
    };
    let records = tree.walk(ctx, Some(tie));
    settle(ctx.report, records)
}

struct FileValidator<'s> {
    driver: Driver,
    state: FileState,
    session: &'s mut Session,
    dir: Option<PathBuf>,
    recurse: bool,
}

impl<'s> FileValidator<'s> {
    fn new(driver: Driver, session: &'s mut Session, dir: Option<PathBuf>) -> Self {
        Self {
            driver,
            state: FileState::new(),
            session,
            dir,
            recurse: true,
        }
    }

    fn ctx(&mut self) -> FileContext<'_> {
        FileContext {
            driver: &self.driver,
            state: &self.state,
            report: &mut self.session.report,
            compat: self.session.options.compat,
        }
    }

    fn record(&mut self, complaint: Complaint) {
        self.session.report.record(complaint);
    }

    /// Progress lines are logged at normal verbosity and above.
    fn narrate(&self) -> bool {
        self.session.options.verbosity >= Verbosity::Normal
    }

    fn run(&mut self) -> CheckResult<()> {
        self.session.stats.files += 1;
        let compat = self.session.options.compat;
        let loaded = Superblock::load(&self.driver, &mut self.session.report, compat);
        let Some(sb) = settle(&mut self.session.report, loaded)? else {
            return Ok(());
        };
        self.driver.set_base(sb.signature_offset);
        self.install(&sb);
        self.apply_driver_info_block()?;
        self.check_eof();
        self.session.report.flush();

        if !is_undef(self.state.ext_addr) {
            self.validate_extension()?;
        }
        match self.session.options.object_address {
            Some(addr) => {
                self.recurse = false;
                self.validate_object(addr)?;
            }
            None => self.validate_root(&sb)?,
        }
        if self.narrate() {
            tracing::info!(
                file = %self.driver.name().display(),
                headers = self.state.visited_count(),
                "file walk complete"
            );
        }
        Ok(())
    }

    fn install(&mut self, sb: &Superblock) {
        let st = &mut self.state;
        st.sizes = sb.sizes;
        st.superblock_version = sb.version;
        if let Some(k) = sb.sym_leaf_k.filter(|&k| k > 0) {
            st.sym_leaf_k = k;
        }
        if let Some(k) = sb.group_internal_k.filter(|&k| k > 0) {
            st.group_internal_k = k;
        }
        if let Some(k) = sb.istore_k.filter(|&k| k > 0) {
            st.istore_k = k;
        }
        st.base_addr = sb.base_addr;
        st.ext_addr = sb.ext_addr;
        st.eoa = sb.eoa;
        st.driver_addr = sb.driver_addr;
        st.root_addr = sb.root_addr;
    }

    fn apply_driver_info_block(&mut self) -> CheckResult<()> {
        let addr = self.state.driver_addr;
        if is_undef(addr) {
            return Ok(());
        }
        let block = DriverInfoBlock::load(&self.driver, addr, self.state.eoa, &mut self.session.report);
        if let Some(block) = settle(&mut self.session.report, block)? {
            tracing::debug!(addr, id = %block.driver_id, "driver information block");
            self.driver.apply_driver_info(&block.driver_id, &block.info)?;
        }
        Ok(())
    }

    fn check_eof(&mut self) {
        let eoa = self.state.eoa;
        // Multi members are sparse; their end of file says nothing about EOA.
        if is_undef(eoa) || self.driver.kind() == DriverKind::Multi {
            return;
        }
        let eof = self.driver.eof();
        if eof < eoa {
            self.record(
                Complaint::new(Level::Superblock, "superblock: truncated file, end of file is before the end of allocated space")
                    .at(0)
                    .value(eof),
            );
        }
    }

    fn validate_extension(&mut self) -> CheckResult<()> {
        let addr = self.state.ext_addr;
        if self.narrate() {
            tracing::info!(addr, "validating superblock extension");
        }
        if !self.state.mark_visited(addr) {
            return Ok(());
        }
        self.session.stats.headers += 1;
        let mut ctx = self.ctx();
        let loaded = ObjectHeader::load(&mut ctx, addr);
        let Some(header) = settle(ctx.report, loaded)? else {
            return Ok(());
        };
        for msg in &header.messages {
            match &msg.decoded {
                Some(Message::BTreeK(k)) => {
                    if k.group_leaf_k > 0 {
                        self.state.sym_leaf_k = k.group_leaf_k;
                    }
                    if k.group_internal_k > 0 {
                        self.state.group_internal_k = k.group_internal_k;
                    }
                    if k.istore_k > 0 {
                        self.state.istore_k = k.istore_k;
                    }
                }
                Some(Message::DriverInfo(info)) => {
                    self.driver.apply_driver_info(&info.id(), &info.info)?;
                }
                Some(Message::SharedMessageTable(t)) => self.load_sohm(t)?,
                Some(Message::FileSpaceInfo(f)) => self.validate_file_space(&f.managers)?,
                Some(Message::Nil) | Some(Message::Unknown { .. }) | None => {}
                Some(_) => self.record(
                    Complaint::new(Level::Message, format!("superblock extension: unexpected {} message", msg.mtype))
                        .at(msg.address)
                        .value(u64::from(msg.mtype.to_u16())),
                ),
            }
        }
        self.session.report.flush();
        Ok(())
    }

    fn load_sohm(&mut self, msg: &SohmTableMessage) -> CheckResult<()> {
        let mut ctx = self.ctx();
        let loaded = SohmTable::load(&mut ctx, msg.table_addr, msg.num_indexes);
        let Some(table) = settle(ctx.report, loaded)? else {
            return Ok(());
        };
        let checked = table.validate(&mut ctx);
        settle(ctx.report, checked)?;
        self.state.sohm = Some(table);
        Ok(())
    }

    fn validate_file_space(&mut self, managers: &[u64]) -> CheckResult<()> {
        let mut ctx = self.ctx();
        for &addr in managers.iter().filter(|a| !is_undef(**a)) {
            let sections = free_space::validate(&mut ctx, addr, FreeSpaceOwner::File);
            settle(ctx.report, sections)?;
        }
        Ok(())
    }

    fn validate_root(&mut self, sb: &Superblock) -> CheckResult<()> {
        let root = self.state.root_addr;
        self.validate_object(root)?;
        let Some(&ScratchPad::Group { btree_addr, heap_addr }) = sb.root_entry.as_ref().map(|e| &e.cache) else {
            return Ok(());
        };
        let Some(header) = self.quiet_header(root)? else {
            return Ok(());
        };
        match header.first(MessageType::SymbolTable) {
            Some(Message::SymbolTable(stab)) => {
                if stab.btree_addr != btree_addr || stab.heap_addr != heap_addr {
                    self.record(
                        Complaint::new(
                            Level::Superblock,
                            "superblock: cached root group B-tree or heap address differs from the root group",
                        )
                        .at(0)
                        .value(btree_addr),
                    );
                }
            }
            _ => self.record(
                Complaint::new(
                    Level::Superblock,
                    "superblock: root entry caches a symbol table the root group does not have",
                )
                .at(0),
            ),
        }
        self.session.report.flush();
        Ok(())
    }

    /// Decode a header without recording anything.
    fn quiet_header(&self, addr: u64) -> CheckResult<Option<ObjectHeader>> {
        let mut scratch = Report::new(0, true);
        let mut ctx = FileContext {
            driver: &self.driver,
            state: &self.state,
            report: &mut scratch,
            compat: self.session.options.compat,
        };
        let loaded = ObjectHeader::load(&mut ctx, addr);
        settle(ctx.report, loaded)
    }

    fn validate_object(&mut self, addr: u64) -> CheckResult<()> {
        if !self.state.addr_valid(addr) {
            self.record(Complaint::new(Level::Message, "object header: invalid address").value(addr));
            return Ok(());
        }
        if !self.state.mark_visited(addr) {
            tracing::debug!(addr, "object header already validated");
            return Ok(());
        }
        self.session.stats.headers += 1;
        if self.narrate() {
            tracing::info!(addr, "validating object header");
        }
        let mut ctx = self.ctx();
        let loaded = ObjectHeader::load(&mut ctx, addr);
        let Some(mut header) = settle(ctx.report, loaded)? else {
            self.session.report.flush();
            return Ok(());
        };
        if self.session.options.verbosity == Verbosity::Debug {
            for m in &header.messages {
                tracing::debug!(addr, kind = %m.mtype, at = m.address, "decoded message");
            }
        }
        self.resolve_shared(&mut header)?;
        self.cross_check(&header);
        let follow_ups = self.follow_messages(&header)?;
        self.session.report.flush();

        if !self.recurse {
            return Ok(());
        }
        for f in follow_ups {
            match f {
                FollowUp::Header(child) => self.validate_object(child)?,
                FollowUp::External { file, path } => {
                    self.session.stats.external_links += 1;
                    if self.session.options.follow_external {
                        self.validate_external(&file, &path)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Fill in the bodies of shared messages.
    fn resolve_shared(&mut self, header: &mut ObjectHeader) -> CheckResult<()> {
        for i in 0..header.messages.len() {
            let (mt, at, shared) = {
                let m = &header.messages[i];
                (m.mtype, m.address, m.shared)
            };
            let Some(shared) = shared else {
                continue;
            };
            header.messages[i].decoded = match shared.kind {
                SharedKind::Committed { addr } => self.committed_message(mt, addr, at)?,
                SharedKind::Sohm { heap_id } => self.sohm_message(mt, &heap_id, at)?,
            };
        }
        Ok(())
    }

    fn committed_message(&mut self, mt: MessageType, target: u64, at: u64) -> CheckResult<Option<Message>> {
        if !self.state.addr_valid(target) {
            self.record(
                Complaint::new(Level::Message, "shared message: invalid committed object address")
                    .at(at)
                    .value(target),
            );
            return Ok(None);
        }
        if self.recurse {
            self.validate_object(target)?;
        }
        let Some(committed) = self.quiet_header(target)? else {
            return Ok(None);
        };
        let found = committed.first(mt).cloned();
        if found.is_none() {
            self.record(
                Complaint::new(Level::Message, format!("shared message: committed object holds no {mt} message"))
                    .at(at)
                    .value(target),
            );
        }
        Ok(found)
    }

    fn sohm_message(&mut self, mt: MessageType, heap_id: &[u8], at: u64) -> CheckResult<Option<Message>> {
        let index = self.state.sohm.as_ref().and_then(|t| t.index_for(mt)).cloned();
        let Some(index) = index else {
            self.record(
                Complaint::new(Level::Message, format!("shared message: no shared message index holds {mt}"))
                    .at(at)
                    .value(u64::from(mt.to_u16())),
            );
            return Ok(None);
        };
        let mut ctx = self.ctx();
        let raw = sohm::read_message(&mut ctx, &index, heap_id);
        let Some(raw) = settle(ctx.report, raw)? else {
            return Ok(None);
        };
        let mut mctx = MessageContext::new(ctx.sizes(), ctx.compat, at);
        let decoded = Message::decode(mt, &raw, &mut mctx);
        ctx.report.extend(mctx.complaints);
        settle(ctx.report, decoded)
    }

    fn cross_check(&mut self, header: &ObjectHeader) {
        let at = header.address;
        if header.has(MessageType::SymbolTable) && header.has(MessageType::LinkInfo) {
            self.record(Complaint::new(
                Level::Message,
                "object header: both Symbol Table and Link Info messages present",
            )
            .at(at));
        }
        if !header.has(MessageType::DataLayout) {
            return;
        }
        for (mt, what) in [(MessageType::Dataspace, "dataspace"), (MessageType::Datatype, "datatype")] {
            if !header.has(mt) {
                self.record(
                    Complaint::new(Level::Message, format!("object header: data layout without a {what}")).at(at),
                );
            }
        }
        if let (Some(Message::Layout(layout)), Some(Message::Dataspace(space))) =
            (header.first(MessageType::DataLayout), header.first(MessageType::Dataspace))
        {
            if let LayoutClass::Chunked { dims, .. } = &layout.class {
                if dims.len() != space.rank() + 1 {
                    self.record(
                        Complaint::new(
                            Level::Message,
                            "layout: chunk dimensionality does not match the dataspace rank",
                        )
                        .at(at)
                        .value(dims.len() as u64),
                    );
                }
            }
        }
    }

    fn follow_messages(&mut self, header: &ObjectHeader) -> CheckResult<Vec<FollowUp>> {
        let mut out = Vec::new();
        for msg in &header.messages {
            let at = msg.address;
            match &msg.decoded {
                Some(Message::SymbolTable(stab)) => self.follow_symbol_table(stab, &mut out)?,
                Some(Message::LinkInfo(info)) => self.follow_link_info(info, at, &mut out)?,
                Some(Message::Link(link)) => follow_link(link, &mut out),
                Some(Message::Layout(layout)) => self.follow_layout(header, layout, at)?,
                Some(Message::ExternalFiles(list)) => self.follow_external_files(list, at)?,
                Some(Message::AttributeInfo(info)) => self.follow_attribute_info(info, at, &mut out)?,
                Some(Message::Attribute(attr)) => self.follow_attribute(attr, at, &mut out)?,
                Some(Message::FileSpaceInfo(f)) => self.validate_file_space(&f.managers)?,
                Some(Message::SharedMessageTable(_)) => self.record(
                    Complaint::new(
                        Level::Message,
                        "shared message table message outside the superblock extension",
                    )
                    .at(at),
                ),
                _ => {}
            }
        }
        Ok(out)
    }

    fn follow_symbol_table(&mut self, stab: &SymbolTableMessage, out: &mut Vec<FollowUp>) -> CheckResult<()> {
        let mut ctx = self.ctx();
        let heap = LocalHeap::load(&mut ctx, stab.heap_addr);
        let Some(heap) = settle(ctx.report, heap)? else {
            return Ok(());
        };
        let nodes = btree_v1::walk_group(&mut ctx, stab.btree_addr, &heap);
        let nodes = settle(ctx.report, nodes)?.unwrap_or_default();
        for addr in nodes {
            let node = SymbolNode::load(&mut ctx, addr, &heap);
            if let Some(node) = settle(ctx.report, node)? {
                out.extend(node.entries.iter().map(|e| FollowUp::Header(e.header_addr)));
            }
            ctx.report.flush();
        }
        Ok(())
    }

    fn follow_link_info(&mut self, info: &LinkInfo, at: u64, out: &mut Vec<FollowUp>) -> CheckResult<()> {
        if is_undef(info.heap_addr) {
            if !is_undef(info.name_index_addr) {
                self.record(
                    Complaint::new(Level::Message, "link info: name index without a fractal heap")
                        .at(at)
                        .value(info.name_index_addr),
                );
            }
            return Ok(());
        }
        let mut ctx = self.ctx();
        let heap = FractalHeap::load(&mut ctx, info.heap_addr);
        let Some(heap) = settle(ctx.report, heap)? else {
            return Ok(());
        };
        let checked = heap.validate(&mut ctx);
        settle(ctx.report, checked)?;

        let names = walk_dense(&mut ctx, &heap, info.name_index_addr, RecordKind::LinkName)?;
        for record in names.iter().flatten() {
            let raw = read_dense(&mut ctx, &heap, record);
            let Some(raw) = settle(ctx.report, raw)? else {
                continue;
            };
            let mut mctx = MessageContext::new(ctx.sizes(), ctx.compat, heap.address);
            let link = Link::decode(&raw, &mut mctx);
            ctx.report.extend(mctx.complaints);
            if let Some(link) = settle(ctx.report, link)? {
                follow_link(&link, out);
            }
        }
        if let Some(order_addr) = info.order_index_addr.filter(|a| !is_undef(*a)) {
            let order = walk_dense(&mut ctx, &heap, order_addr, RecordKind::LinkCreationOrder)?;
            if let (Some(names), Some(order)) = (&names, &order) {
                ctx.require(names.len() == order.len(), || {
                    Complaint::new(
                        Level::Structure,
                        "link info: creation order index and name index hold different link counts",
                    )
                    .at(order_addr)
                    .value(order.len() as u64)
                });
            }
        }
        ctx.report.flush();
        Ok(())
    }

    fn follow_attribute_info(&mut self, info: &AttributeInfo, at: u64, out: &mut Vec<FollowUp>) -> CheckResult<()> {
        if is_undef(info.heap_addr) {
            if !is_undef(info.name_index_addr) {
                self.record(
                    Complaint::new(Level::Message, "attribute info: name index without a fractal heap")
                        .at(at)
                        .value(info.name_index_addr),
                );
            }
            return Ok(());
        }
        let mut ctx = self.ctx();
        let heap = FractalHeap::load(&mut ctx, info.heap_addr);
        let Some(heap) = settle(ctx.report, heap)? else {
            return Ok(());
        };
        let checked = heap.validate(&mut ctx);
        settle(ctx.report, checked)?;

        let names = walk_dense(&mut ctx, &heap, info.name_index_addr, RecordKind::AttributeName)?;
        let mut attrs = Vec::new();
        for record in names.iter().flatten() {
            let raw = read_dense(&mut ctx, &heap, record);
            let Some(raw) = settle(ctx.report, raw)? else {
                continue;
            };
            let mut mctx = MessageContext::new(ctx.sizes(), ctx.compat, heap.address);
            let attr = Attribute::decode(&raw, &mut mctx);
            ctx.report.extend(mctx.complaints);
            if let Some(attr) = settle(ctx.report, attr)? {
                attrs.push(attr);
            }
        }
        if let Some(order_addr) = info.order_index_addr.filter(|a| !is_undef(*a)) {
            let order = walk_dense(&mut ctx, &heap, order_addr, RecordKind::AttributeCreationOrder)?;
            if let (Some(names), Some(order)) = (&names, &order) {
                ctx.require(names.len() == order.len(), || {
                    Complaint::new(
                        Level::Structure,
                        "attribute info: creation order index and name index hold different attribute counts",
                    )
                    .at(order_addr)
                    .value(order.len() as u64)
                });
            }
        }
        ctx.report.flush();
        for attr in &attrs {
            self.follow_attribute(attr, heap.address, out)?;
        }
        Ok(())
    }

    fn follow_attribute(&mut self, attr: &Attribute, at: u64, out: &mut Vec<FollowUp>) -> CheckResult<()> {
        for (mt, embedded) in [
            (MessageType::Datatype, attr.datatype.shared()),
            (MessageType::Dataspace, attr.dataspace.shared()),
        ] {
            let Some(shared) = embedded else {
                continue;
            };
            match shared.kind {
                SharedKind::Committed { .. } => follow_shared(&shared, out),
                SharedKind::Sohm { heap_id } => {
                    self.sohm_message(mt, &heap_id, at)?;
                }
            }
        }
        Ok(())
    }

    fn follow_external_files(&mut self, list: &ExternalFileList, at: u64) -> CheckResult<()> {
        let mut ctx = self.ctx();
        let heap = LocalHeap::load(&mut ctx, list.heap_addr);
        let Some(heap) = settle(ctx.report, heap)? else {
            return Ok(());
        };
        for slot in &list.slots {
            match heap.name_at(slot.name_offset) {
                Ok(name) if name.is_empty() => ctx.record(
                    Complaint::new(Level::Message, "external data files: empty file name")
                        .at(at)
                        .value(slot.name_offset),
                ),
                Ok(_) => {}
                Err(CheckError::Format(c)) => ctx.record(*c),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn follow_layout(&mut self, header: &ObjectHeader, layout: &Layout, at: u64) -> CheckResult<()> {
        let space = match header.first(MessageType::Dataspace) {
            Some(Message::Dataspace(s)) => Some(s),
            _ => None,
        };
        let type_size = match header.first(MessageType::Datatype) {
            Some(Message::Datatype(t)) => Some(u64::from(t.size)),
            _ => None,
        };
        let data_size = space
            .zip(type_size)
            .and_then(|(s, t)| s.num_elements().checked_mul(t));
        let filtered = header.has(MessageType::FilterPipeline);

        match &layout.class {
            LayoutClass::Compact { data } => {
                if let Some(expected) = data_size {
                    if data.len() as u64 != expected {
                        self.record(
                            Complaint::new(Level::Message, "layout: compact data size does not match the dataset")
                                .at(at)
                                .value(data.len() as u64),
                        );
                    }
                }
            }
            LayoutClass::Contiguous { addr, size } => {
                if is_undef(*addr) {
                    return Ok(());
                }
                if let (Some(stored), Some(expected)) = (size, data_size) {
                    if *stored < expected {
                        self.record(
                            Complaint::new(Level::Message, "layout: contiguous storage smaller than the dataset")
                                .at(at)
                                .value(*stored),
                        );
                    }
                }
                let len = size.or(data_size).unwrap_or(0);
                if !self.state.extent_valid(*addr, len) {
                    self.record(
                        Complaint::new(
                            Level::Message,
                            "layout: contiguous storage extends beyond the end of allocated space",
                        )
                        .at(at)
                        .value(*addr),
                    );
                }
            }
            LayoutClass::Chunked { addr, dims, index, .. } => {
                if !is_undef(*addr) {
                    let dataset_dims = space.map(|s| s.dims.as_slice());
                    self.follow_chunks(*addr, dims, *index, dataset_dims, filtered, at)?;
                }
            }
            LayoutClass::Virtual { heap_addr, heap_index } => {
                if is_undef(*heap_addr) {
                    return Ok(());
                }
                let mut ctx = self.ctx();
                let collection = GlobalHeapCollection::load(&mut ctx, *heap_addr);
                if let Some(collection) = settle(ctx.report, collection)? {
                    ctx.require(collection.object(*heap_index).is_some(), || {
                        Complaint::new(Level::Message, "layout: virtual dataset mappings not found in the global heap")
                            .at(at)
                            .value(u64::from(*heap_index))
                    });
                }
            }
        }
        Ok(())
    }

    fn follow_chunks(
        &mut self,
        addr: u64,
        dims: &[u64],
        index: ChunkIndexKind,
        dataset_dims: Option<&[u64]>,
        filtered: bool,
        at: u64,
    ) -> CheckResult<()> {
        let chunk_bytes = dims.iter().fold(1u64, |acc, &d| acc.saturating_mul(d));
        let rank = dims.len().saturating_sub(1);
        let client = if filtered { CLIENT_FILTERED_CHUNKS } else { CLIENT_CHUNKS };
        let mut ctx = self.ctx();
        let extent_complaint = |what: &str, value: u64| {
            Complaint::new(Level::Structure, format!("chunk index: {what} extends beyond the end of allocated space"))
                .at(at)
                .value(value)
        };
        match index {
            ChunkIndexKind::BTreeV1 => {
                let chunks = btree_v1::walk_chunks(&mut ctx, addr, dims.len());
                settle(ctx.report, chunks)?;
            }
            ChunkIndexKind::SingleChunk { filtered_size, .. } => {
                let len = filtered_size.unwrap_or(chunk_bytes);
                ctx.require(ctx.state.extent_valid(addr, len), || extent_complaint("single chunk", addr));
            }
            ChunkIndexKind::Implicit => {
                let nchunks = dataset_dims.map_or(1, |dd| {
                    dd.iter()
                        .zip(dims)
                        .fold(1u64, |acc, (&n, &c)| acc.saturating_mul(n.div_ceil(c.max(1))))
                });
                let len = nchunks.saturating_mul(chunk_bytes);
                ctx.require(ctx.state.extent_valid(addr, len), || extent_complaint("implicit chunk storage", addr));
            }
            ChunkIndexKind::FixedArray { page_bits } => {
                let fa = FixedArray::load(&mut ctx, addr);
                let Some(fa) = settle(ctx.report, fa)? else {
                    return Ok(());
                };
                ctx.require(fa.page_bits == page_bits, || {
                    Complaint::new(Level::Message, "layout: fixed array page size differs from the index header")
                        .at(at)
                        .value(u64::from(fa.page_bits))
                });
                ctx.require(fa.client == client, || {
                    Complaint::new(Level::Structure, "fixed array header: client does not match the filter pipeline")
                        .at(addr)
                        .value(u64::from(fa.client))
                });
                let elements = fa.elements(&mut ctx, chunk_bytes);
                settle(ctx.report, elements)?;
            }
            ChunkIndexKind::ExtensibleArray {
                max_bits,
                index_elements,
                min_pointers,
                min_elements,
                page_bits,
            } => {
                let ea = ExtensibleArray::load(&mut ctx, addr);
                let Some(ea) = settle(ctx.report, ea)? else {
                    return Ok(());
                };
                let same = (ea.max_bits, ea.index_elements, ea.min_pointers, ea.min_elements, ea.page_bits)
                    == (max_bits, index_elements, min_pointers, min_elements, page_bits);
                ctx.require(same, || {
                    Complaint::new(
                        Level::Message,
                        "layout: extensible array parameters differ from the index header",
                    )
                    .at(at)
                });
                ctx.require(ea.client == client, || {
                    Complaint::new(
                        Level::Structure,
                        "extensible array header: client does not match the filter pipeline",
                    )
                    .at(addr)
                    .value(u64::from(ea.client))
                });
                let elements = ea.index_block(&mut ctx, chunk_bytes);
                settle(ctx.report, elements)?;
            }
            ChunkIndexKind::BTreeV2 { node_size, split, merge } => {
                let shape = RecordShape { chunk_ndims: Some(rank) };
                let tree = BTreeV2::load(&mut ctx, addr, shape);
                let Some(tree) = settle(ctx.report, tree)? else {
                    return Ok(());
                };
                let expected = if filtered { RecordKind::FilteredChunk } else { RecordKind::Chunk };
                if tree.kind != expected {
                    ctx.record(
                        Complaint::new(Level::Structure, format!("B-tree v2: expected {expected:?} records"))
                            .at(addr)
                            .value(u64::from(tree.kind.to_u8())),
                    );
                    return Ok(());
                }
                ctx.require(
                    (tree.node_size, tree.split_percent, tree.merge_percent) == (node_size, split, merge),
                    || {
                        Complaint::new(Level::Message, "layout: B-tree v2 parameters differ from the index header")
                            .at(at)
                            .value(u64::from(tree.node_size))
                    },
                );
                let records = tree.walk(&mut ctx, None);
                for record in settle(ctx.report, records)?.unwrap_or_default() {
                    let (chunk, len) = match record {
                        Record::Chunk { addr, .. } => (addr, chunk_bytes),
                        Record::FilteredChunk { addr, size, .. } => (addr, size),
                        _ => continue,
                    };
                    ctx.require(ctx.state.extent_valid(chunk, len), || extent_complaint("chunk", chunk));
                }
            }
        }
        ctx.report.flush();
        Ok(())
    }

    fn validate_external(&mut self, file: &str, path: &str) -> CheckResult<()> {
        let Some(target) = self.resolve_external(file) else {
            self.record(Complaint::new(Level::Message, format!("external link: target file {file} not found")));
            return Ok(());
        };
        let driver = match Driver::open(&target) {
            Ok(driver) => driver,
            Err(e) => {
                self.record(Complaint::new(Level::Message, format!("external link: {e}")));
                return Ok(());
            }
        };
        if let Ok(id) = driver.identity() {
            if !self.session.external_files.insert(id) {
                tracing::debug!(file = %target.display(), "external file already validated");
                return Ok(());
            }
        }
        if self.narrate() {
            tracing::info!(file = %target.display(), object = path, "validating external link target");
        }
        let prev = self.session.report.set_current_file(Some(target.clone()));
        let dir = target.parent().map(Path::to_path_buf);
        let result = FileValidator::new(driver, &mut *self.session, dir).run();
        self.session.report.flush();
        self.session.report.set_current_file(prev);
        if let Err(e) = result {
            self.record(
                Complaint::new(Level::Message, format!("external link: validation of target stopped: {e}"))
                    .in_file(target),
            );
        }
        Ok(())
    }

    /// First existing candidate for an external link's file name: absolute
    /// as given, then under each search prefix, then beside this file, then
    /// relative to the working directory.
    fn resolve_external(&self, file: &str) -> Option<PathBuf> {
        let given = Path::new(file);
        let tail = if given.is_absolute() {
            given.file_name().map_or(given, Path::new)
        } else {
            given
        };
        let mut candidates = Vec::new();
        if given.is_absolute() {
            candidates.push(given.to_path_buf());
        }
        candidates.extend(self.session.options.ext_prefixes.iter().map(|p| p.join(tail)));
        if let Some(dir) = &self.dir {
            candidates.push(dir.join(tail));
        }
        candidates.push(tail.to_path_buf());
        candidates.into_iter().find(|c| openable(c))
    }
}

fn openable(path: &Path) -> bool {
    if path.is_file() || path.to_string_lossy().contains('%') {
        return true;
    }
    let mut multi_super = path.as_os_str().to_owned();
    multi_super.push("-s.h5");
    Path::new(&multi_super).is_file()
}
