// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The function side of a USB RNDIS network adapter.
//!
//! [`RndisFunction`] sits between a USB peripheral controller
//! ([`UsbFunction`]) and a local network stack ([`Uplink`]). It answers the
//! host's RNDIS control messages, frames outgoing Ethernet frames onto the
//! bulk IN endpoint, and unwraps frames received on the bulk OUT endpoint.
//!
//! All engine state lives behind a single lock. Calls into the uplink and
//! endpoint configuration calls into the controller are made with the lock
//! released.

#![forbid(unsafe_code)]

pub mod buffers;
pub mod codec;
mod control;
pub mod descriptors;
pub mod rndisprot;

pub use buffers::Transfer;
pub use buffers::TransferStatus;

use buffers::BufferPool;
use buffers::CompleteTransfer;
use buffers::ReturnError;
use buffers::Role;
use control::DeviceInfo;
use control::DeviceState;
use control::PendingResponses;
use descriptors::EndpointDescriptor;
use descriptors::Endpoints;
use descriptors::FunctionDescriptors;
use descriptors::Interfaces;
use descriptors::SetupPacket;
use descriptors::UsbSpeed;
use futures::channel::oneshot;
use futures::future::Shared;
use futures::FutureExt;
use net_backend_resources::mac_address::MacAddress;
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Weak;
use std::task::Context;
use std::task::Poll;
use thiserror::Error;
use zerocopy::IntoBytes;

/// Size of the data area of each bulk buffer, and the maximum transfer size
/// advertised to the host.
pub const MAX_TRANSFER_SIZE: usize = 2048;

const ETHERNET_HEADER_LEN: u32 = 14;

const NOTIFICATION_SIZE: usize = size_of::<rndisprot::ResponseAvailable>();

const DEFAULT_RX_BUFFERS: u32 = 8;
const DEFAULT_TX_BUFFERS: u32 = 8;
const DEFAULT_NOTIFICATION_BUFFERS: u32 = 4;
const DEFAULT_LINK_SPEED: u64 = 100 * 1000 * 1000;
const DEFAULT_VENDOR_DESCRIPTION: &str = "USB RNDIS function";

/// Transfer direction of an endpoint, from the host's point of view.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

/// The USB peripheral controller the function is bound to.
pub trait UsbFunction: Send + Sync {
    fn allocate_interface(&self) -> anyhow::Result<u8>;

    /// Allocates an endpoint and returns its address.
    fn allocate_endpoint(&self, direction: Direction) -> anyhow::Result<u8>;

    fn configure_endpoint(&self, descriptor: &EndpointDescriptor) -> anyhow::Result<()>;

    fn disable_endpoint(&self, address: u8) -> anyhow::Result<()>;

    /// Queues a transfer. The controller calls [`Transfer::complete`] when it
    /// finishes, from any thread, but never from within this call.
    fn submit_transfer(&self, transfer: Transfer) -> Result<(), SubmitError>;

    /// Cancels every transfer queued on the endpoint. Each is completed with
    /// [`TransferStatus::Cancelled`].
    fn cancel_all(&self, address: u8);

    /// Bytes the controller reserves at the start of every transfer buffer.
    fn transfer_header_size(&self) -> usize;
}

/// A failed submission. The transfer is handed back so its buffer can be
/// returned to its pool.
#[derive(Debug, Error)]
#[error("failed to submit transfer")]
pub struct SubmitError {
    pub transfer: Transfer,
    #[source]
    pub error: anyhow::Error,
}

/// The network stack the function delivers frames to.
pub trait Uplink: Send + Sync {
    /// Reports a link transition. Reports are serialized and never repeat
    /// the previous value. Must not call back into the function's
    /// configuration methods.
    fn link_status(&self, online: bool);

    fn deliver_frame(&self, frame: &[u8]);
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    /// Largest Ethernet frame, including the Ethernet header, accepted by
    /// [`RndisFunction::queue_transmit`].
    pub max_frame_size: usize,
    pub mac_address: MacAddress,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to allocate interface")]
    AllocateInterface(#[source] anyhow::Error),
    #[error("failed to allocate {0:?} endpoint")]
    AllocateEndpoint(Direction, #[source] anyhow::Error),
    #[error("failed to configure endpoint {0:#x}")]
    ConfigureEndpoint(u8, #[source] anyhow::Error),
    #[error("failed to disable endpoint {0:#x}")]
    DisableEndpoint(u8, #[source] anyhow::Error),
    #[error("failed to generate mac address: {0}")]
    GenerateMacAddress(getrandom::Error),
    #[error("an uplink is already attached")]
    AlreadyAttached,
    #[error("operation not supported")]
    NotSupported,
    #[error("function is shutting down")]
    ShuttingDown,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransmitError {
    /// No transmit buffer is free, or the link is not online. Retry later.
    #[error("no transmit buffer available")]
    Unavailable,
    #[error("frame of {len} bytes exceeds maximum of {max}")]
    TooLarge { len: usize, max: usize },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ControlError {
    #[error("unsupported control request {request:#x} type {request_type:#x}")]
    NotSupported { request_type: u8, request: u8 },
}

/// Lifecycle phase of the function.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Phase {
    Unconfigured,
    Configured,
    /// Configured, and the host has set the packet filter.
    Ready,
    Draining,
    Shutdown,
}

pub struct RndisFunctionBuilder {
    mac_address: Option<MacAddress>,
    rx_buffers: u32,
    tx_buffers: u32,
    notification_buffers: u32,
    link_speed: u64,
    vendor_description: String,
}

impl RndisFunctionBuilder {
    /// Sets the persisted device address. Without one a random
    /// locally-administered address is generated.
    pub fn mac_address(mut self, mac_address: MacAddress) -> Self {
        self.mac_address = Some(mac_address);
        self
    }

    pub fn rx_buffers(mut self, count: u32) -> Self {
        self.rx_buffers = count;
        self
    }

    pub fn tx_buffers(mut self, count: u32) -> Self {
        self.tx_buffers = count;
        self
    }

    pub fn notification_buffers(mut self, count: u32) -> Self {
        self.notification_buffers = count;
        self
    }

    /// Sets the link speed reported to the host, in bits per second.
    pub fn link_speed(mut self, bits_per_second: u64) -> Self {
        self.link_speed = bits_per_second;
        self
    }

    pub fn vendor_description(mut self, description: impl Into<String>) -> Self {
        self.vendor_description = description.into();
        self
    }

    /// Binds the function to the controller: allocates its interfaces and
    /// endpoints and fills the buffer pools.
    pub fn build(self, usb: Arc<dyn UsbFunction>) -> Result<RndisFunction, Error> {
        let mac_address = match self.mac_address {
            Some(mac_address) => mac_address,
            None => {
                let mac_address = MacAddress::random_local().map_err(Error::GenerateMacAddress)?;
                tracing::info!(%mac_address, "generated mac address");
                mac_address
            }
        };

        let interfaces = Interfaces {
            control: usb.allocate_interface().map_err(Error::AllocateInterface)?,
            data: usb.allocate_interface().map_err(Error::AllocateInterface)?,
        };
        let allocate_endpoint = |direction| {
            usb.allocate_endpoint(direction)
                .map_err(|err| Error::AllocateEndpoint(direction, err))
        };
        let endpoints = Endpoints {
            notification: allocate_endpoint(Direction::In)?,
            bulk_in: allocate_endpoint(Direction::In)?,
            bulk_out: allocate_endpoint(Direction::Out)?,
        };

        let header_len = usb.transfer_header_size();
        let mut vendor_description = self.vendor_description.into_bytes();
        vendor_description.push(0);
        let info = DeviceInfo {
            mac_address,
            max_frame_size: (MAX_TRANSFER_SIZE - codec::PACKET_HEADER_LEN) as u32,
            link_speed: self.link_speed,
            vendor_description,
        };

        let state = EngineState {
            device: DeviceState::default(),
            responses: PendingResponses::default(),
            notification: BufferPool::new(
                Role::Notification,
                self.notification_buffers,
                header_len,
                NOTIFICATION_SIZE,
            ),
            rx: BufferPool::new(Role::BulkOut, self.rx_buffers, header_len, MAX_TRANSFER_SIZE),
            tx: BufferPool::new(Role::BulkIn, self.tx_buffers, header_len, MAX_TRANSFER_SIZE),
            uplink: None,
            shutdown: None,
            shutdown_done: false,
        };

        tracing::debug!(
            ?interfaces,
            ?endpoints,
            header_len,
            %mac_address,
            "rndis function bound"
        );

        let inner = Arc::new_cyclic(|this| Inner {
            this: this.clone(),
            usb,
            interfaces,
            endpoints,
            header_len,
            info,
            link_reported: Mutex::new(false),
            state: Mutex::new(state),
        });
        Ok(RndisFunction { inner })
    }
}

/// Resolves when the shutdown sequence has finished.
#[derive(Clone)]
#[must_use]
pub struct ShutdownComplete(Shared<oneshot::Receiver<()>>);

impl std::fmt::Debug for ShutdownComplete {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ShutdownComplete").finish()
    }
}

impl Future for ShutdownComplete {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        // A dropped sender also means the sequence is over.
        self.0.poll_unpin(cx).map(drop)
    }
}

struct EngineState {
    device: DeviceState,
    responses: PendingResponses,
    notification: BufferPool,
    rx: BufferPool,
    tx: BufferPool,
    uplink: Option<Arc<dyn Uplink>>,
    /// Set once shutdown has been requested.
    shutdown: Option<ShutdownComplete>,
    shutdown_done: bool,
}

impl EngineState {
    fn draining(&self) -> bool {
        self.shutdown.is_some()
    }

    fn pool_mut(&mut self, role: Role) -> &mut BufferPool {
        match role {
            Role::Notification => &mut self.notification,
            Role::BulkIn => &mut self.tx,
            Role::BulkOut => &mut self.rx,
        }
    }

    fn return_buffer(&mut self, transfer: Transfer) {
        let (id, buffer) = transfer.into_buffer();
        match self.pool_mut(id.role).put(id.index, buffer) {
            Ok(()) => {}
            Err(ReturnError::Released) => {
                tracing::trace!(?id, "dropping buffer returned after release");
            }
            Err(err) => {
                tracing::warn!(
                    ?id,
                    error = &err as &dyn std::error::Error,
                    "unexpected buffer return"
                );
            }
        }
    }
}

struct Inner {
    this: Weak<Inner>,
    usb: Arc<dyn UsbFunction>,
    interfaces: Interfaces,
    endpoints: Endpoints,
    header_len: usize,
    info: DeviceInfo,
    /// Whether the attached uplink was last told the link is online. Held
    /// across calls to [`Uplink::link_status`] and always taken before
    /// `state`.
    link_reported: Mutex<bool>,
    state: Mutex<EngineState>,
}

impl Inner {
    fn transfer(
        &self,
        endpoint: u8,
        id: buffers::BufferId,
        buffer: Box<[u8]>,
        len: usize,
    ) -> Transfer {
        Transfer::new(endpoint, id, buffer, self.header_len, len, self.this.clone())
    }

    /// Submits a transfer, returning its buffer to the pool on failure.
    fn submit(&self, state: &mut EngineState, transfer: Transfer) -> bool {
        match self.usb.submit_transfer(transfer) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(
                    endpoint = err.transfer.endpoint(),
                    error = err.error.as_ref() as &dyn std::error::Error,
                    "failed to submit transfer"
                );
                state.return_buffer(err.transfer);
                false
            }
        }
    }

    /// Queues every idle receive buffer to the bulk OUT endpoint.
    fn arm_receive(&self, state: &mut EngineState) {
        while let Some((id, buffer)) = state.rx.acquire() {
            let transfer = self.transfer(self.endpoints.bulk_out, id, buffer, MAX_TRANSFER_SIZE);
            if !self.submit(state, transfer) {
                break;
            }
        }
    }

    /// Tells the host a response is waiting on the control endpoint.
    fn notify_response_available(&self, state: &mut EngineState) {
        if state.draining() {
            return;
        }
        let Some((id, mut buffer)) = state.notification.acquire() else {
            tracing::warn!("no notification buffer, dropping response notification");
            return;
        };
        buffer[self.header_len..][..NOTIFICATION_SIZE].copy_from_slice(
            rndisprot::ResponseAvailable {
                notification: rndisprot::NOTIFICATION_RESPONSE_AVAILABLE,
                reserved: 0,
            }
            .as_bytes(),
        );
        let transfer = self.transfer(self.endpoints.notification, id, buffer, NOTIFICATION_SIZE);
        self.submit(state, transfer);
    }

    /// Brings the uplink's view of the link in line with the device state.
    fn update_link(&self) {
        let mut reported = self.link_reported.lock();
        let (online, uplink) = {
            let state = self.state.lock();
            (state.device.online() && !state.draining(), state.uplink.clone())
        };
        let Some(uplink) = uplink else {
            return;
        };
        if online != *reported {
            tracing::debug!(online, "link status");
            *reported = online;
            uplink.link_status(online);
        }
    }

    fn receive_complete(&self, transfer: Transfer, status: TransferStatus) {
        if let TransferStatus::Completed { .. } = status {
            // Frames arriving while offline are dropped.
            let uplink = {
                let state = self.state.lock();
                state.uplink.clone().filter(|_| state.device.online())
            };
            let mut delivered = 0;
            for frame in codec::decode_packet_frames(transfer.data()) {
                match frame {
                    Ok([]) => {}
                    Ok(frame) => {
                        if let Some(uplink) = &uplink {
                            uplink.deliver_frame(frame);
                            delivered += 1;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(
                            error = &err as &dyn std::error::Error,
                            delivered,
                            "dropping remainder of receive transfer"
                        );
                    }
                }
            }
            tracing::trace!(len = transfer.len(), delivered, "receive complete");
        }

        let mut state = self.state.lock();
        state.return_buffer(transfer);
        if status != TransferStatus::Cancelled && state.device.online() && !state.draining() {
            self.arm_receive(&mut state);
        }
    }

    fn run_shutdown(&self) {
        tracing::debug!("rndis function shutting down");
        for endpoint in self.endpoints.all() {
            self.usb.cancel_all(endpoint);
        }
        {
            let mut reported = self.link_reported.lock();
            let uplink = {
                let mut state = self.state.lock();
                state.notification.release();
                state.rx.release();
                state.tx.release();
                state.responses.clear();
                state.device.configured = false;
                state.device.ready = false;
                state.uplink.take()
            };
            if let Some(uplink) = uplink.filter(|_| *reported) {
                uplink.link_status(false);
            }
            *reported = false;
        }
        self.state.lock().shutdown_done = true;
        tracing::debug!("rndis function shut down");
    }
}

impl CompleteTransfer for Inner {
    fn transfer_complete(&self, transfer: Transfer, status: TransferStatus) {
        match transfer.id().role {
            Role::BulkOut => self.receive_complete(transfer, status),
            role => {
                if status == TransferStatus::Failed {
                    tracing::warn!(?role, endpoint = transfer.endpoint(), "transfer failed");
                }
                self.state.lock().return_buffer(transfer);
            }
        }
    }
}

/// A USB RNDIS network function.
pub struct RndisFunction {
    inner: Arc<Inner>,
}

impl RndisFunction {
    pub fn builder() -> RndisFunctionBuilder {
        RndisFunctionBuilder {
            mac_address: None,
            rx_buffers: DEFAULT_RX_BUFFERS,
            tx_buffers: DEFAULT_TX_BUFFERS,
            notification_buffers: DEFAULT_NOTIFICATION_BUFFERS,
            link_speed: DEFAULT_LINK_SPEED,
            vendor_description: DEFAULT_VENDOR_DESCRIPTION.to_owned(),
        }
    }

    /// The descriptors for the function's interfaces and endpoints.
    pub fn descriptors(&self, speed: UsbSpeed) -> FunctionDescriptors {
        descriptors::function_descriptors(self.inner.interfaces, self.inner.endpoints, speed)
    }

    pub fn query_link_info(&self) -> LinkInfo {
        LinkInfo {
            max_frame_size: self.inner.info.max_frame_size as usize,
            mac_address: self.inner.info.mac_address,
        }
    }

    pub fn phase(&self) -> Phase {
        let state = self.inner.state.lock();
        if state.shutdown_done {
            Phase::Shutdown
        } else if state.draining() {
            Phase::Draining
        } else if state.device.online() {
            Phase::Ready
        } else if state.device.configured {
            Phase::Configured
        } else {
            Phase::Unconfigured
        }
    }

    /// Attaches the uplink. If the link is already online, the uplink is told
    /// so immediately.
    pub fn start(&self, uplink: Arc<dyn Uplink>) -> Result<(), Error> {
        {
            let mut state = self.inner.state.lock();
            if state.draining() {
                return Err(Error::ShuttingDown);
            }
            if state.uplink.is_some() {
                return Err(Error::AlreadyAttached);
            }
            state.uplink = Some(uplink);
        }
        tracing::debug!("uplink attached");
        self.inner.update_link();
        Ok(())
    }

    /// Detaches the uplink. The link stays offline until the host sets the
    /// packet filter again.
    pub fn stop(&self) {
        let mut reported = self.inner.link_reported.lock();
        let mut state = self.inner.state.lock();
        state.uplink = None;
        state.device.ready = false;
        *reported = false;
        tracing::debug!("uplink detached");
    }

    /// Frames `frame` and queues it to the host. Never blocks.
    pub fn queue_transmit(&self, frame: &[u8]) -> Result<(), TransmitError> {
        let inner = &*self.inner;
        let max = inner.info.max_frame_size as usize;
        if frame.len() > max {
            return Err(TransmitError::TooLarge {
                len: frame.len(),
                max,
            });
        }
        let mut state = inner.state.lock();
        if !state.device.online() || state.draining() {
            return Err(TransmitError::Unavailable);
        }
        let (id, mut buffer) = state.tx.acquire().ok_or(TransmitError::Unavailable)?;
        let Some(len) = codec::write_packet_frame(&mut buffer[inner.header_len..], frame) else {
            state.return_buffer(inner.transfer(inner.endpoints.bulk_in, id, buffer, 0));
            return Err(TransmitError::TooLarge {
                len: frame.len(),
                max,
            });
        };
        let transfer = inner.transfer(inner.endpoints.bulk_in, id, buffer, len);
        if !inner.submit(&mut state, transfer) {
            return Err(TransmitError::Unavailable);
        }
        Ok(())
    }

    /// Handles a SEND_ENCAPSULATED_COMMAND from the host. Exactly one
    /// response is queued for every call.
    pub fn handle_control_write(&self, bytes: &[u8]) {
        let inner = &*self.inner;
        let went_online = {
            let mut state = inner.state.lock();
            let state = &mut *state;
            let handled = control::handle_control_write(&inner.info, &mut state.device, bytes);
            state.responses.push(handled.response);
            let went_online = handled.went_online && !state.draining();
            if went_online {
                inner.arm_receive(state);
            }
            inner.notify_response_available(state);
            went_online
        };
        if went_online {
            inner.update_link();
        }
    }

    /// Handles a GET_ENCAPSULATED_RESPONSE from the host, writing the oldest
    /// pending response to `out`. Returns the number of bytes written.
    pub fn read_response(&self, out: &mut [u8]) -> usize {
        self.inner.state.lock().responses.read(out)
    }

    /// Dispatches a class request addressed to the communication interface.
    /// Returns the number of bytes written to `data_in`.
    pub fn control(
        &self,
        setup: &SetupPacket,
        data_out: &[u8],
        data_in: &mut [u8],
    ) -> Result<usize, ControlError> {
        let unsupported = ControlError::NotSupported {
            request_type: setup.request_type,
            request: setup.request,
        };
        if !setup.is_class_interface_request()
            || setup.index.get() & 0xff != u16::from(self.inner.interfaces.control)
        {
            return Err(unsupported);
        }
        let len = setup.length.get() as usize;
        match (setup.request, setup.is_device_to_host()) {
            (descriptors::SEND_ENCAPSULATED_COMMAND, false) => {
                self.handle_control_write(&data_out[..len.min(data_out.len())]);
                Ok(0)
            }
            (descriptors::GET_ENCAPSULATED_RESPONSE, true) => {
                let len = len.min(data_in.len());
                Ok(self.read_response(&mut data_in[..len]))
            }
            _ => Err(unsupported),
        }
    }

    /// Enables or disables the endpoints as the host configures or
    /// deconfigures the device.
    pub fn set_configured(&self, configured: bool, speed: UsbSpeed) -> Result<(), Error> {
        let inner = &*self.inner;
        if configured {
            {
                let state = inner.state.lock();
                if state.draining() {
                    return Err(Error::ShuttingDown);
                }
                if state.device.configured {
                    return Ok(());
                }
            }
            let descriptors = inner.endpoints.descriptors(speed);
            for (i, descriptor) in descriptors.iter().enumerate() {
                if let Err(err) = inner.usb.configure_endpoint(descriptor) {
                    // Leave no endpoint half enabled.
                    for configured in &descriptors[..i] {
                        let endpoint = configured.endpoint_address;
                        if let Err(err) = inner.usb.disable_endpoint(endpoint) {
                            tracing::warn!(
                                endpoint,
                                error = err.as_ref() as &dyn std::error::Error,
                                "failed to disable endpoint after configure failure"
                            );
                        }
                    }
                    return Err(Error::ConfigureEndpoint(descriptor.endpoint_address, err));
                }
            }
            inner.state.lock().device.configured = true;
            tracing::debug!(?speed, "configured");
        } else {
            {
                let mut state = inner.state.lock();
                state.device.configured = false;
                state.device.ready = false;
            }
            inner.update_link();
            for endpoint in inner.endpoints.all() {
                inner
                    .usb
                    .disable_endpoint(endpoint)
                    .map_err(|err| Error::DisableEndpoint(endpoint, err))?;
            }
            tracing::debug!("deconfigured");
        }
        Ok(())
    }

    /// RNDIS interfaces have no alternate settings.
    pub fn set_interface(&self, interface: u8, alt_setting: u8) -> Result<(), Error> {
        tracing::debug!(interface, alt_setting, "set interface not supported");
        Err(Error::NotSupported)
    }

    /// Starts the shutdown sequence on a worker thread: cancels all
    /// outstanding transfers, releases the buffer pools and detaches the
    /// uplink. Every call returns a future for the same single sequence.
    pub fn shutdown(&self) -> ShutdownComplete {
        let (send, done) = {
            let mut state = self.inner.state.lock();
            if let Some(done) = &state.shutdown {
                return done.clone();
            }
            let (send, recv) = oneshot::channel();
            let done = ShutdownComplete(recv.shared());
            state.shutdown = Some(done.clone());
            (send, done)
        };

        let inner = self.inner.clone();
        let spawned = std::thread::Builder::new()
            .name("rndis-shutdown".to_owned())
            .spawn(move || {
                inner.run_shutdown();
                let _ = send.send(());
            });
        if let Err(err) = spawned {
            tracing::error!(
                error = &err as &dyn std::error::Error,
                "failed to spawn shutdown worker, shutting down inline"
            );
            self.inner.run_shutdown();
        }
        done
    }

    /// The host suspended the bus. There is no resume path, so this shuts
    /// the function down.
    pub fn suspend(&self) -> ShutdownComplete {
        self.shutdown()
    }

    pub fn unbind(self) -> ShutdownComplete {
        self.shutdown()
    }
}
