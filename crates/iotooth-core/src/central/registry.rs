//! 连接注册表 - 地址到链路处理器的映射
//!
//! 处理器存放在槽位中，地址索引到槽位。同一地址最多只有一个存活的处理器；
//! 替换时先关闭旧处理器。`close_all` 按槽位升序关闭，顺序是确定的。

use std::collections::HashMap;

use log::debug;

use crate::central::link::CentralLinkHandler;
use crate::transport::{CentralTransport, DeviceAddress, LinkId};

#[derive(Default)]
pub struct ConnectionRegistry {
    slots: Vec<Option<CentralLinkHandler>>,
    index: HashMap<DeviceAddress, usize>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, address: &DeviceAddress) -> bool {
        self.index.contains_key(address)
    }

    pub fn get(&self, address: &DeviceAddress) -> Option<&CentralLinkHandler> {
        let slot = *self.index.get(address)?;
        self.slots[slot].as_ref()
    }

    pub fn get_mut(&mut self, address: &DeviceAddress) -> Option<&mut CentralLinkHandler> {
        let slot = *self.index.get(address)?;
        self.slots[slot].as_mut()
    }

    /// 查找属于 `link` 的处理器；链路已被替换或移除时返回 `None`
    pub fn get_for_link(
        &mut self,
        address: &DeviceAddress,
        link: LinkId,
    ) -> Option<&mut CentralLinkHandler> {
        self.get_mut(address).filter(|h| h.link() == link)
    }

    /// 按槽位顺序列出地址
    pub fn addresses(&self) -> Vec<DeviceAddress> {
        self.slots
            .iter()
            .flatten()
            .map(|h| h.address().clone())
            .collect()
    }

    /// 安装处理器；同地址已有处理器时先关闭它并复用其槽位
    pub fn insert<T: CentralTransport>(&mut self, transport: &mut T, handler: CentralLinkHandler) {
        let address = handler.address().clone();
        if let Some(&slot) = self.index.get(&address) {
            if let Some(mut previous) = self.slots[slot].take() {
                debug!("Replacing handler for {}, closing previous link", address);
                previous.close(transport);
            }
            self.slots[slot] = Some(handler);
            return;
        }

        let slot = match self.slots.iter().position(Option::is_none) {
            Some(slot) => {
                self.slots[slot] = Some(handler);
                slot
            }
            None => {
                self.slots.push(Some(handler));
                self.slots.len() - 1
            }
        };
        debug!("Registered {} in slot {}", address, slot);
        self.index.insert(address, slot);
    }

    /// 移除并关闭处理器，地址不存在时什么都不做
    pub fn remove<T: CentralTransport>(
        &mut self,
        transport: &mut T,
        address: &DeviceAddress,
    ) -> bool {
        let Some(slot) = self.index.remove(address) else {
            return false;
        };
        if let Some(mut handler) = self.slots[slot].take() {
            handler.close(transport);
        }
        true
    }

    /// 关闭并移除全部处理器，返回被关闭的地址（槽位顺序）
    pub fn close_all<T: CentralTransport>(&mut self, transport: &mut T) -> Vec<DeviceAddress> {
        let mut closed = Vec::with_capacity(self.index.len());
        for slot in &mut self.slots {
            if let Some(mut handler) = slot.take() {
                handler.close(transport);
                closed.push(handler.address().clone());
            }
        }
        self.slots.clear();
        self.index.clear();
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CentralConfig;
    use crate::transport::{CentralEventSender, DiscoveredDevice, ScanId};
    use uuid::Uuid;

    #[derive(Default)]
    struct LinkCounter {
        next: u64,
        closed: Vec<LinkId>,
    }

    impl CentralTransport for LinkCounter {
        fn bind(&mut self, _events: CentralEventSender) {}
        fn radio_available(&mut self) -> bool {
            true
        }
        fn start_scan(&mut self, _scan: ScanId, _filter: Uuid) {}
        fn stop_scan(&mut self, _scan: ScanId) {}
        fn open_link(&mut self, _address: &DeviceAddress) -> Option<LinkId> {
            self.next += 1;
            Some(LinkId(self.next))
        }
        fn close_link(&mut self, link: LinkId) {
            self.closed.push(link);
        }
        fn discover_services(&mut self, _link: LinkId, _service: Uuid) {}
        fn read_characteristic(&mut self, _link: LinkId, _characteristic: Uuid) {}
        fn write_characteristic(&mut self, _link: LinkId, _characteristic: Uuid, _value: &[u8]) {}
        fn set_notify(&mut self, _link: LinkId, _characteristic: Uuid, _enabled: bool) {}
    }

    fn open(transport: &mut LinkCounter, address: &str) -> CentralLinkHandler {
        CentralLinkHandler::open(
            transport,
            &DiscoveredDevice::new(address),
            &CentralConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_replace_closes_previous() {
        let mut transport = LinkCounter::default();
        let mut registry = ConnectionRegistry::new();

        let first = open(&mut transport, "AA");
        registry.insert(&mut transport, first);
        let second = open(&mut transport, "AA");
        registry.insert(&mut transport, second);

        assert_eq!(registry.len(), 1);
        assert_eq!(transport.closed, vec![LinkId(1)]);
        assert_eq!(registry.get(&"AA".into()).unwrap().link(), LinkId(2));
        assert!(registry.get_for_link(&"AA".into(), LinkId(1)).is_none());
    }

    #[test]
    fn test_slots_are_reused_in_order() {
        let mut transport = LinkCounter::default();
        let mut registry = ConnectionRegistry::new();

        for addr in ["A", "B", "C"] {
            let handler = open(&mut transport, addr);
            registry.insert(&mut transport, handler);
        }
        assert!(registry.remove(&mut transport, &"A".into()));
        assert!(!registry.remove(&mut transport, &"A".into()));

        let handler = open(&mut transport, "D");
        registry.insert(&mut transport, handler);

        let expected: Vec<DeviceAddress> = ["D", "B", "C"].into_iter().map(Into::into).collect();
        assert_eq!(registry.addresses(), expected);

        let closed = registry.close_all(&mut transport);
        assert_eq!(closed, expected);
        assert!(registry.is_empty());
        assert_eq!(
            transport.closed,
            vec![LinkId(1), LinkId(4), LinkId(2), LinkId(3)]
        );
    }
}
