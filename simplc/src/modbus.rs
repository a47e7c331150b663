//! Modbus side of a variable: the register bank collaborator interface, an
//! in-process data store, and a TCP slave built on
//! [tokio-modbus](https://github.com/slowtec/tokio-modbus) serving that store.

use std::{
    collections::{BTreeMap, HashMap},
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use futures::future;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_modbus::server::tcp::{accept_tcp_connection, Server};
use tokio_modbus::slave::SlaveId;
use tokio_modbus::{ExceptionCode, Request, Response, SlaveRequest};
use tracing::{debug, error, info, warn};

use crate::codec::{Address, Quantity, Word};
use crate::error::Result;
use crate::variable::RegisterKind;

/// Notification that an external master wrote `count` objects starting at `address`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterWrite {
    pub slave: SlaveId,
    pub kind: RegisterKind,
    pub address: Address,
    pub count: Quantity,
}

/// Register storage of the Modbus engine, addressed by `(slave, kind, address)`.
///
/// Bit kinds hold one word per address, either `0` or `1`.
#[async_trait]
pub trait RegisterBank: Send + Sync {
    /// Create the registers at `address..address + words.len()` that do not exist yet.
    async fn allocate(
        &self,
        slave: SlaveId,
        kind: RegisterKind,
        address: Address,
        words: &[Word],
    ) -> Result<()>;

    async fn read(
        &self,
        slave: SlaveId,
        kind: RegisterKind,
        address: Address,
        cnt: Quantity,
    ) -> Result<Vec<Word>>;

    /// Engine-side write. Does not raise a [`RegisterWrite`] notification.
    async fn write(
        &self,
        slave: SlaveId,
        kind: RegisterKind,
        address: Address,
        words: &[Word],
    ) -> Result<()>;

    /// Receive a notification for every write made by an external master.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<RegisterWrite>;
}

#[derive(Debug, Clone, Default)]
/// Raw Modbus objects of one kind on one slave.
pub struct Registers(BTreeMap<Address, Word>);

impl Registers {
    /// Create consecutive registers starting at `addr` unless they already exist.
    pub fn allocate(&mut self, addr: Address, words: &[Word]) {
        for (reg_addr, value) in (addr..=Address::MAX).zip(words) {
            self.0.entry(reg_addr).or_insert(*value);
        }
    }

    /// Read `cnt` consecutive registers starting at `addr`.
    pub fn read(
        &self,
        addr: Address,
        cnt: Quantity,
    ) -> std::result::Result<Vec<Word>, std::io::Error> {
        let mut response_values = vec![0; cnt.into()];
        for i in 0..cnt {
            let reg_addr = addr.checked_add(i).ok_or_else(|| no_register(addr))?;
            if let Some(r) = self.0.get(&reg_addr) {
                response_values[i as usize] = *r;
            } else {
                return Err(no_register(reg_addr));
            }
        }

        Ok(response_values)
    }

    /// Write `words` into existing consecutive registers starting at `addr`.
    ///
    /// Nothing is written unless every target register exists.
    pub fn write(
        &mut self,
        addr: Address,
        words: &[Word],
    ) -> std::result::Result<(), std::io::Error> {
        if usize::from(Address::MAX - addr) + 1 < words.len() {
            return Err(no_register(addr));
        }
        for reg_addr in (addr..=Address::MAX).take(words.len()) {
            if !self.0.contains_key(&reg_addr) {
                return Err(no_register(reg_addr));
            }
        }
        for (reg_addr, value) in (addr..=Address::MAX).zip(words) {
            self.0.insert(reg_addr, *value);
        }

        Ok(())
    }

    pub fn addresses(&self) -> Vec<Address> {
        self.0.keys().copied().collect()
    }
}

fn no_register(reg_addr: Address) -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::AddrNotAvailable,
        format!("no register at address {reg_addr}"),
    )
}

#[derive(Debug, Default)]
/// In-process Modbus data store shared by the TCP slave and the sync engine.
pub struct DataStore {
    registers: Mutex<HashMap<(SlaveId, RegisterKind), Registers>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<RegisterWrite>>>,
    writes: AtomicUsize,
}

impl DataStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read_registers(
        &self,
        slave: SlaveId,
        kind: RegisterKind,
        addr: Address,
        cnt: Quantity,
    ) -> std::result::Result<Vec<Word>, std::io::Error> {
        self.registers
            .lock()
            .get(&(slave, kind))
            .ok_or_else(|| unknown_slave(slave, kind))?
            .read(addr, cnt)
    }

    fn write_registers(
        &self,
        slave: SlaveId,
        kind: RegisterKind,
        addr: Address,
        words: &[Word],
    ) -> std::result::Result<(), std::io::Error> {
        self.registers
            .lock()
            .get_mut(&(slave, kind))
            .ok_or_else(|| unknown_slave(slave, kind))?
            .write(addr, words)
    }

    /// Write made by an external master. Subscribers are notified.
    pub fn external_write(
        &self,
        slave: SlaveId,
        kind: RegisterKind,
        addr: Address,
        words: &[Word],
    ) -> std::result::Result<(), std::io::Error> {
        self.write_registers(slave, kind, addr, words)?;
        let event = RegisterWrite {
            slave,
            kind,
            address: addr,
            count: words.len() as Quantity,
        };
        self.subscribers.lock().retain(|tx| tx.send(event).is_ok());
        Ok(())
    }

    /// Number of engine-side writes made through [`RegisterBank::write`].
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn slaves(&self) -> Vec<SlaveId> {
        let mut slaves: Vec<SlaveId> = self
            .registers
            .lock()
            .keys()
            .map(|(slave, _)| *slave)
            .collect();
        slaves.sort_unstable();
        slaves.dedup();
        slaves
    }

    pub fn addresses(&self, slave: SlaveId, kind: RegisterKind) -> Vec<Address> {
        self.registers
            .lock()
            .get(&(slave, kind))
            .map(Registers::addresses)
            .unwrap_or_default()
    }

    fn service_call(
        &self,
        req: SlaveRequest<'static>,
    ) -> std::result::Result<Response, ExceptionCode> {
        let SlaveRequest { slave, request } = req;
        debug!(slave, ?request, "request");
        let illegal_address = |err: std::io::Error| {
            warn!(slave, "Exception::IllegalDataAddress - {err}");
            ExceptionCode::IllegalDataAddress
        };
        match request {
            Request::ReadCoils(addr, cnt) => self
                .read_registers(slave, RegisterKind::Coil, addr, cnt)
                .map(|words| Response::ReadCoils(words.into_iter().map(|w| w != 0).collect()))
                .map_err(illegal_address),
            Request::ReadDiscreteInputs(addr, cnt) => self
                .read_registers(slave, RegisterKind::DiscreteInput, addr, cnt)
                .map(|words| {
                    Response::ReadDiscreteInputs(words.into_iter().map(|w| w != 0).collect())
                })
                .map_err(illegal_address),
            Request::ReadInputRegisters(addr, cnt) => self
                .read_registers(slave, RegisterKind::InputRegister, addr, cnt)
                .map(Response::ReadInputRegisters)
                .map_err(illegal_address),
            Request::ReadHoldingRegisters(addr, cnt) => self
                .read_registers(slave, RegisterKind::HoldingRegister, addr, cnt)
                .map(Response::ReadHoldingRegisters)
                .map_err(illegal_address),
            Request::WriteSingleCoil(addr, coil) => self
                .external_write(slave, RegisterKind::Coil, addr, &[Word::from(coil)])
                .map(|_| Response::WriteSingleCoil(addr, coil))
                .map_err(illegal_address),
            Request::WriteMultipleCoils(addr, coils) => {
                let words: Vec<Word> = coils.iter().map(|&c| Word::from(c)).collect();
                self.external_write(slave, RegisterKind::Coil, addr, &words)
                    .map(|_| Response::WriteMultipleCoils(addr, words.len() as Quantity))
                    .map_err(illegal_address)
            }
            Request::WriteSingleRegister(addr, value) => self
                .external_write(
                    slave,
                    RegisterKind::HoldingRegister,
                    addr,
                    std::slice::from_ref(&value),
                )
                .map(|_| Response::WriteSingleRegister(addr, value))
                .map_err(illegal_address),
            Request::WriteMultipleRegisters(addr, values) => self
                .external_write(slave, RegisterKind::HoldingRegister, addr, &values)
                .map(|_| Response::WriteMultipleRegisters(addr, values.len() as Quantity))
                .map_err(illegal_address),
            _ => {
                error!("Exception::IllegalFunction - Unimplemented function code: {request:?}");
                Err(ExceptionCode::IllegalFunction)
            }
        }
    }
}

fn unknown_slave(slave: SlaveId, kind: RegisterKind) -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::AddrNotAvailable,
        format!("slave {slave} has no {kind}s"),
    )
}

#[async_trait]
impl RegisterBank for DataStore {
    async fn allocate(
        &self,
        slave: SlaveId,
        kind: RegisterKind,
        address: Address,
        words: &[Word],
    ) -> Result<()> {
        self.registers
            .lock()
            .entry((slave, kind))
            .or_default()
            .allocate(address, words);
        Ok(())
    }

    async fn read(
        &self,
        slave: SlaveId,
        kind: RegisterKind,
        address: Address,
        cnt: Quantity,
    ) -> Result<Vec<Word>> {
        Ok(self.read_registers(slave, kind, address, cnt)?)
    }

    async fn write(
        &self,
        slave: SlaveId,
        kind: RegisterKind,
        address: Address,
        words: &[Word],
    ) -> Result<()> {
        self.write_registers(slave, kind, address, words)?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<RegisterWrite> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }
}

#[derive(Debug, Clone)]
/// [tokio_modbus::server::Service](https://docs.rs/tokio-modbus/latest/tokio_modbus/server/trait.Service.html) over a shared [`DataStore`].
pub struct ModbusService(pub Arc<DataStore>);

impl tokio_modbus::server::Service for ModbusService {
    type Request = SlaveRequest<'static>;
    type Response = Response;
    type Exception = ExceptionCode;
    type Future = future::Ready<std::result::Result<Self::Response, Self::Exception>>;

    fn call(&self, req: Self::Request) -> Self::Future {
        future::ready(self.0.service_call(req))
    }
}

/// Serve `store` as a Modbus TCP slave until the listener fails.
pub async fn serve_tcp(socket_addr: SocketAddr, store: Arc<DataStore>) -> std::io::Result<()> {
    let listener = TcpListener::bind(socket_addr).await?;
    serve_listener(listener, store).await
}

/// Same as [`serve_tcp`] on an already bound listener.
pub async fn serve_listener(listener: TcpListener, store: Arc<DataStore>) -> std::io::Result<()> {
    let socket_addr = listener.local_addr()?;
    info!(%socket_addr, "Modbus TCP server listening");
    let server = Server::new(listener);
    let service = ModbusService(store);
    let new_service = |_socket_addr| Ok(Some(service.clone()));
    let on_connected = |stream, socket_addr| async move {
        accept_tcp_connection(stream, socket_addr, new_service)
    };
    let on_process_error = |err| {
        error!("Modbus server error: {err}");
    };
    server.serve(&on_connected, on_process_error).await
}

/// Utility function to spawn and run the Modbus TCP slave forever.
pub fn spawn_tcp_server(
    socket_addr: SocketAddr,
    store: Arc<DataStore>,
) -> JoinHandle<std::io::Result<()>> {
    tokio::spawn(serve_tcp(socket_addr, store))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store_with_holding() -> DataStore {
        let store = DataStore::new();
        store
            .allocate(1, RegisterKind::HoldingRegister, 10, &[1, 2])
            .await
            .unwrap();
        store.allocate(1, RegisterKind::Coil, 0, &[0]).await.unwrap();
        store
    }

    #[test]
    fn registers_reject_gaps() {
        let mut registers = Registers::default();
        registers.allocate(0, &[5, 6]);
        assert_eq!(registers.read(0, 2).unwrap(), vec![5, 6]);
        assert!(registers.read(1, 2).is_err());
        assert!(registers.write(1, &[7, 8]).is_err());
        // Failed writes leave the registers untouched.
        assert_eq!(registers.read(0, 2).unwrap(), vec![5, 6]);
    }

    #[test]
    fn allocate_keeps_existing_values() {
        let mut registers = Registers::default();
        registers.allocate(0, &[5]);
        registers.allocate(0, &[9, 9]);
        assert_eq!(registers.read(0, 2).unwrap(), vec![5, 9]);
    }

    #[tokio::test]
    async fn engine_writes_are_counted_but_not_notified() {
        let store = store_with_holding().await;
        let mut rx = store.subscribe();
        store
            .write(1, RegisterKind::HoldingRegister, 10, &[3, 4])
            .await
            .unwrap();
        assert_eq!(store.write_count(), 1);
        assert!(rx.try_recv().is_err());
        assert_eq!(
            store.read(1, RegisterKind::HoldingRegister, 10, 2).await.unwrap(),
            vec![3, 4]
        );
    }

    #[tokio::test]
    async fn service_write_notifies() {
        let store = Arc::new(store_with_holding().await);
        let mut rx = store.subscribe();
        let service = ModbusService(store.clone());
        let response = tokio_modbus::server::Service::call(
            &service,
            SlaveRequest {
                slave: 1,
                request: Request::WriteSingleCoil(0, true),
            },
        )
        .await
        .unwrap();
        assert_eq!(response, Response::WriteSingleCoil(0, true));
        assert_eq!(
            rx.recv().await.unwrap(),
            RegisterWrite {
                slave: 1,
                kind: RegisterKind::Coil,
                address: 0,
                count: 1
            }
        );
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn service_reads_holding_registers() {
        let service = ModbusService(Arc::new(store_with_holding().await));
        let response = tokio_modbus::server::Service::call(
            &service,
            SlaveRequest {
                slave: 1,
                request: Request::ReadHoldingRegisters(10, 2),
            },
        )
        .await
        .unwrap();
        assert_eq!(response, Response::ReadHoldingRegisters(vec![1, 2]));
    }

    #[tokio::test]
    async fn service_rejects_unknown_addresses_and_slaves() {
        let service = ModbusService(Arc::new(store_with_holding().await));
        let unknown_address = tokio_modbus::server::Service::call(
            &service,
            SlaveRequest {
                slave: 1,
                request: Request::ReadHoldingRegisters(50, 1),
            },
        )
        .await;
        assert_eq!(unknown_address, Err(ExceptionCode::IllegalDataAddress));
        let unknown_slave = tokio_modbus::server::Service::call(
            &service,
            SlaveRequest {
                slave: 9,
                request: Request::ReadCoils(0, 1),
            },
        )
        .await;
        assert_eq!(unknown_slave, Err(ExceptionCode::IllegalDataAddress));
    }

    #[tokio::test]
    async fn listings() {
        let store = store_with_holding().await;
        assert_eq!(store.slaves(), vec![1]);
        assert_eq!(store.addresses(1, RegisterKind::HoldingRegister), vec![10, 11]);
        assert!(store.addresses(2, RegisterKind::Coil).is_empty());
    }
}
